#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    let _ = toolgate_mcp::decode_sse_frames(&s);
    let _ = toolgate_mcp::parse_first_json_frame(&s);
    let _ = serde_json::from_str::<toolgate_mcp::JsonRpcMessage>(&s);
});
