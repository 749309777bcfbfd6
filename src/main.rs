fn main() {
    if let Err(e) = voice_coordinator_lib::run() {
        eprintln!("voice-audio-coordinator: {:#}", e);
        std::process::exit(1);
    }
}
