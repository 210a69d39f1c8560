use periscope_client::gateway::{parse_datagram, SchemaRegistry};
use rand::{thread_rng, Rng};

#[test]
fn fuzz_parse_datagram_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = parse_datagram(&data);
    }
}

#[test]
fn random_mutation_of_valid_datagram_is_handled() {
    let mut rng = thread_rng();
    let mut valid = Vec::new();
    valid.extend_from_slice(&1234.5f64.to_le_bytes());
    valid.push(0);
    valid.extend_from_slice(b"/robot/battery\0sensor_msgs/BatteryState\0{\"voltage\":[12.6]}");

    for _ in 0..1_000 {
        let mut mutated = valid.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        if let Ok(message) = parse_datagram(&mutated) {
            // Whatever survived header parsing must also never panic in
            // the registry, whether or not it is valid JSON.
            let registry = SchemaRegistry::new();
            let _ = registry.register_if_schema(&message.msg_type, &message.payload);
        }
    }
}

#[test]
fn fuzz_registry_payloads_never_panic() {
    let mut rng = thread_rng();
    let registry = SchemaRegistry::new();
    for _ in 0..5_000 {
        let len: usize = rng.gen_range(0..512);
        let mut payload = vec![0u8; len];
        rng.fill(&mut payload[..]);
        let _ = registry.register_if_schema("fuzz/Type", &payload);
        let _ = registry.build_parsed_message("fuzz/Type", "/fuzz", &payload);
    }
}
