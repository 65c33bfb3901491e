fn main() {
    if let Err(e) = klbrd_cmd::cmd::run() {
        eprintln!("klbrd: {e}");
        std::process::exit(1);
    }
}
