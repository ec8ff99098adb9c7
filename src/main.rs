fn main() {
    std::process::exit(tts_supervisor::run());
}
