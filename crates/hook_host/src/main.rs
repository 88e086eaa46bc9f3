fn main() {
    if let Err(e) = lib_hook_host::init() {
        eprintln!("❌ Hook host failed: {e}");
        std::process::exit(1);
    }
}
