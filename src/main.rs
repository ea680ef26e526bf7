fn main() {
    std::process::exit(keyloom::run());
}
