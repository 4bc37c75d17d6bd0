//! Logging from the audio thread without allocation.
//!
//! The audio thread may not call into [`log`], which formats and allocates.
//! Instead it pushes chains of preallocated [`RtLogMessage`] values (static
//! strings and numbers, terminated by `End`) into a ring. The post-process
//! worker drains the ring, formats the chain and forwards it to `log`.

use ingen_core::Path;

/// One fragment of an audio-thread log message. A full message is a chain of
/// fragments terminated by `End`.
#[derive(Clone, Debug)]
pub enum RtLogMessage {
    Str(&'static str),
    Unsigned(u64),
    Float(f64),
    /// Paths are cheap to clone (`EcoString` backed) and never allocated here.
    Path(Path),
    End,
}

impl core::fmt::Display for RtLogMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RtLogMessage::Str(s) => write!(f, "{}", s),
            RtLogMessage::Unsigned(u) => write!(f, "{}", u),
            RtLogMessage::Float(n) => write!(f, "{}", n),
            RtLogMessage::Path(p) => write!(f, "{}", p),
            RtLogMessage::End => Ok(()),
        }
    }
}

impl From<&'static str> for RtLogMessage {
    fn from(value: &'static str) -> Self {
        RtLogMessage::Str(value)
    }
}
impl From<u64> for RtLogMessage {
    fn from(value: u64) -> Self {
        RtLogMessage::Unsigned(value)
    }
}
impl From<u32> for RtLogMessage {
    fn from(value: u32) -> Self {
        RtLogMessage::Unsigned(value as u64)
    }
}
impl From<usize> for RtLogMessage {
    fn from(value: usize) -> Self {
        RtLogMessage::Unsigned(value as u64)
    }
}
impl From<f32> for RtLogMessage {
    fn from(value: f32) -> Self {
        RtLogMessage::Float(value as f64)
    }
}
impl From<f64> for RtLogMessage {
    fn from(value: f64) -> Self {
        RtLogMessage::Float(value)
    }
}
impl From<Path> for RtLogMessage {
    fn from(value: Path) -> Self {
        RtLogMessage::Path(value)
    }
}

/// Audio-thread side of the log channel. If the ring is full the message is
/// dropped; losing a log line beats blocking the cycle.
pub struct RtLogSender {
    producer: rtrb::Producer<RtLogMessage>,
}

impl RtLogSender {
    pub fn push(&mut self, msg: impl Into<RtLogMessage>) {
        let _ = self.producer.push(msg.into());
    }
    pub fn end(&mut self) {
        let _ = self.producer.push(RtLogMessage::End);
    }
}

/// Non-real-time side: drains complete chains and hands each to `handler`.
pub struct RtLogReceiver {
    consumer: rtrb::Consumer<RtLogMessage>,
    pending: Vec<RtLogMessage>,
}

impl RtLogReceiver {
    /// Receive complete message chains. Partial chains stay pending until
    /// their `End` arrives.
    pub fn recv(&mut self, mut handler: impl FnMut(&[RtLogMessage])) {
        while let Ok(msg) = self.consumer.pop() {
            if matches!(msg, RtLogMessage::End) {
                handler(&self.pending);
                self.pending.clear();
            } else {
                self.pending.push(msg);
            }
        }
    }

    /// Drain into the `log` facade at warn level.
    pub fn forward_to_log(&mut self) {
        self.recv(|chain| {
            use core::fmt::Write;
            let mut line = String::new();
            for msg in chain {
                let _ = write!(line, "{}", msg);
            }
            log::warn!("[audio] {}", line);
        });
    }
}

/// Create a connected sender/receiver pair with room for `capacity` fragments.
pub fn channel(capacity: usize) -> (RtLogSender, RtLogReceiver) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        RtLogSender { producer },
        RtLogReceiver {
            consumer,
            pending: Vec::new(),
        },
    )
}

/// Log a chain of fragments from the audio thread.
///
/// ```ignore
/// rt_log!(sender; "voice allocation failed for ", path, " poly ", poly);
/// ```
#[macro_export]
macro_rules! rt_log {
    ($sender:expr; $($msg:expr),* $(,)?) => {{
        $( $sender.push($msg); )*
        $sender.end();
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_are_reassembled() {
        let (mut tx, mut rx) = channel(16);
        rt_log!(tx; "dropped ", 3u32, " events");
        rt_log!(tx; "second");
        let mut chains = Vec::new();
        rx.recv(|chain| {
            let text: String = chain.iter().map(|m| m.to_string()).collect();
            chains.push(text);
        });
        assert_eq!(chains, vec!["dropped 3 events".to_string(), "second".to_string()]);
    }
}
