use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

/// One complete line (or the trailing partial line) written by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub node: String,
    pub text: String,
}

#[derive(Debug, Default)]
struct SinkState {
    pending: String,
    transcript: String,
}

/// Line-buffering capture of a script's textual output.
///
/// Written from the worker thread; complete lines are handed to an unbounded
/// channel whose receiver lives on the async side. Sending never blocks, so
/// the worker never touches the consumer directly. Clones share one buffer.
#[derive(Debug, Clone)]
pub struct OutputSink {
    node: Arc<str>,
    tx: Option<mpsc::UnboundedSender<OutputLine>>,
    state: Arc<Mutex<SinkState>>,
}

impl OutputSink {
    pub fn new(node: &str, tx: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self {
            node: Arc::from(node),
            tx: Some(tx),
            state: Arc::default(),
        }
    }

    /// A sink nobody streams from; only the transcript is kept.
    pub fn detached(node: &str) -> Self {
        Self {
            node: Arc::from(node),
            tx: None,
            state: Arc::default(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn write(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut lines = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.transcript.push_str(text);
            state.pending.push_str(text);
            while let Some(idx) = state.pending.find('\n') {
                lines.push(state.pending.drain(..=idx).collect::<String>());
            }
        }
        for line in lines {
            self.emit(line);
        }
    }

    /// Flushes the remaining partial line, if any, as a final payload.
    pub fn finish(&self) {
        let rest = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.pending)
        };
        if !rest.is_empty() {
            self.emit(rest);
        }
    }

    /// Everything written so far, including an unterminated last line.
    pub fn transcript(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .transcript
            .clone()
    }

    fn emit(&self, text: String) {
        if let Some(tx) = &self.tx {
            // The consumer may be gone after a timeout or disconnect.
            let _ = tx.send(OutputLine {
                node: self.node.to_string(),
                text,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line.text);
        }
        out
    }

    #[test]
    fn fragments_are_joined_into_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new("n1", tx);

        sink.write("hel");
        assert!(drain(&mut rx).is_empty());

        sink.write("lo\nwor");
        sink.write("ld\n\nx");
        assert_eq!(drain(&mut rx), vec!["hello\n", "world\n", "\n"]);

        sink.finish();
        assert_eq!(drain(&mut rx), vec!["x"]);
        assert_eq!(sink.transcript(), "hello\nworld\n\nx");
    }

    #[test]
    fn finish_without_pending_emits_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new("n1", tx);
        sink.write("done\n");
        sink.finish();
        assert_eq!(drain(&mut rx), vec!["done\n"]);
    }

    #[test]
    fn lines_carry_node_and_keep_order_across_threads() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new("plot", tx);
        let writer = sink.clone();
        std::thread::spawn(move || {
            for i in 0..50 {
                writer.write(&format!("{i}\n"));
            }
        })
        .join()
        .unwrap();

        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            assert_eq!(line.node, "plot");
            seen.push(line.text.trim_end().parse::<u32>().unwrap());
        }
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn detached_sink_still_records_transcript() {
        let sink = OutputSink::detached("n");
        sink.write("a\nb");
        sink.finish();
        assert_eq!(sink.transcript(), "a\nb");
        assert_eq!(sink.node(), "n");
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = OutputSink::new("n", tx);
        sink.write("still fine\n");
        assert_eq!(sink.transcript(), "still fine\n");
    }
}
