#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Whole input as one V5 frame, then its RTU payload
    if let Ok(frame) = powerwatch::modbus::solarman::decode_frame(data)
        && let Ok(rtu) = powerwatch::modbus::solarman::response_rtu(&frame)
    {
        let count = rtu.get(2).map(|n| u16::from(*n) / 2).unwrap_or(0);
        let _ = powerwatch::modbus::rtu::parse_read_response(rtu, 1, count);
    }
});
