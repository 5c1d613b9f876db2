fn main() {
    if let Err(err) = tomato_desk_lib::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
