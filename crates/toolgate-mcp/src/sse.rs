use anyhow::Context as _;

/// One decoded SSE event: optional `id:` field plus joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub data: String,
}

/// Encode a server-to-client SSE frame.
///
/// The event id is a monotonically increasing counter maintained by the SSE
/// hub; clients replay it via `last-event-id` on reconnect.
pub fn encode_sse_frame(id: u64, data: &str) -> String {
    format!("id: {id}\ndata: {data}\n\n")
}

/// Decode blank-line-delimited SSE events, keeping `id:` and `data:` fields
/// and skipping comments and unknown fields.
pub fn decode_sse_frames(buf: &str) -> Vec<SseFrame> {
    let mut out = Vec::new();
    let mut id: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let l = line.trim_end_matches('\r');

        if l.is_empty() {
            if !data_lines.is_empty() {
                out.push(SseFrame {
                    id: id.take(),
                    data: data_lines.join("\n"),
                });
                data_lines.clear();
            } else {
                id = None;
            }
            continue;
        }

        if l.starts_with(':') {
            continue;
        }

        if let Some(rest) = l.strip_prefix("id:") {
            id = Some(rest.trim().to_string());
            continue;
        }

        if let Some(rest) = l.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if !data_lines.is_empty() {
        out.push(SseFrame {
            id,
            data: data_lines.join("\n"),
        });
    }

    out
}

pub fn parse_first_json_frame(body: &str) -> anyhow::Result<serde_json::Value> {
    let frames = decode_sse_frames(body);
    let first = frames.first().context("no sse frames")?;
    serde_json::from_str(&first.data).context("parse sse data as json")
}
