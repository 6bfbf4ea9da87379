#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes straight off the wire; most inputs fail the checksum,
    // the interesting ones reach the payload parsers
    if let Ok(frame) = hestia::pylontech::decode_frame(data) {
        let _ = hestia::pylontech::parse_analog(&frame);
        let _ = hestia::pylontech::parse_alarm(&frame);
        let _ = hestia::pylontech::parse_serial_number(&frame);
        let _ = hestia::pylontech::parse_manufacturer_info(&frame);
    }
});
