use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::state::{Cursor, Query, QueryResponse, ScreenSnapshot};

pub async fn run(
    mut chunk_rx: mpsc::Receiver<(u64, Bytes)>,
    mut query_rx: mpsc::Receiver<(Query, oneshot::Sender<QueryResponse>)>,
    cols: usize,
    rows: usize,
    scrollback_limit: usize,
) {
    let mut vt = avt::Vt::builder()
        .size(cols, rows)
        .scrollback_limit(scrollback_limit)
        .build();
    let mut decoder = Utf8Decoder::default();
    let mut through_seq: u64 = 0;

    loop {
        tokio::select! {
            Some((seq, data)) = chunk_rx.recv() => {
                feed(&mut vt, &mut decoder, &data);
                through_seq = seq;
            }

            Some((query, response_tx)) = query_rx.recv() => {
                // Chunks queued before the query was sent must be reflected
                // in the answer, so drain them first.
                while let Ok((seq, data)) = chunk_rx.try_recv() {
                    feed(&mut vt, &mut decoder, &data);
                    through_seq = seq;
                }
                let response = handle_query(&mut vt, query, through_seq);
                let _ = response_tx.send(response);
            }

            else => break,
        }
    }
}

fn feed(vt: &mut avt::Vt, decoder: &mut Utf8Decoder, data: &[u8]) {
    let text = decoder.decode(data);
    if !text.is_empty() {
        let _changes = vt.feed_str(&text);
    }
}

fn handle_query(vt: &mut avt::Vt, query: Query, through_seq: u64) -> QueryResponse {
    match query {
        Query::Snapshot => {
            let (cols, rows) = vt.size();
            let cursor = vt.cursor();
            let lines: Vec<String> = vt.lines().map(|l| l.text().trim_end().to_string()).collect();
            let first_visible = lines.len().saturating_sub(rows);
            QueryResponse::Snapshot(ScreenSnapshot {
                cols,
                rows,
                lines,
                first_visible,
                cursor: Cursor {
                    row: cursor.row,
                    col: cursor.col,
                    visible: cursor.visible,
                },
                through_seq,
            })
        }

        Query::Resize { cols, rows } => {
            let _changes = vt.resize(cols, rows);
            QueryResponse::Ok
        }
    }
}

/// Streaming UTF-8 decoder. PTY reads split multi-byte characters; the
/// incomplete tail of one chunk is carried into the next.
#[derive(Debug, Default)]
pub(super) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8.
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: keep for next time.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let remaining = rest.to_vec();
        self.pending = remaining;
        out
    }
}
