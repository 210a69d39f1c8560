use periscope_core::wire::ControlCommand;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

#[test]
fn fuzz_command_parse_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..512);
        let line: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        let _ = ControlCommand::parse(&line);
    }
}

#[test]
fn random_mutation_of_valid_command_is_handled() {
    let mut rng = thread_rng();
    let valid = r#"{"cmd":"update","config":{"ip":"192.168.1.50","portLeft":8554,"portRight":8556,"codec":"JPEG","encodingQuality":85,"bitrate":400000,"horizontalResolution":1920,"verticalResolution":1080,"videoMode":"stereo","fps":60}}"#;

    for _ in 0..2_000 {
        let mut mutated = valid.as_bytes().to_vec();
        let flip_count = rng.gen_range(1..8);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] = rng.gen_range(0x20..0x7f);
        }
        if let Ok(line) = std::str::from_utf8(&mutated) {
            // Mutations may produce valid or invalid commands; conversion
            // to a config must fail cleanly, never panic.
            if let Ok(ControlCommand::Update { config }) = ControlCommand::parse(line) {
                let _ = config.into_config();
            }
        }
    }
}
