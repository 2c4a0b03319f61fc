use std::io::Write;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Lines kept for slow `/api/logs` readers before they start missing some.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 500;

/// Tees formatted tracing output to stderr and to a broadcast channel that
/// backs the daemon log stream.
#[derive(Clone)]
pub(crate) struct LogMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub echo: bool,
}

impl<'a> MakeWriter<'a> for LogMakeWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            sender: self.sender.clone(),
            echo: self.echo,
        }
    }
}

pub(crate) struct LogWriter {
    sender: broadcast::Sender<String>,
    echo: bool,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).trim_end().to_string();
        if !line.is_empty() {
            let _ = self.sender.send(line);
        }
        if self.echo {
            std::io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.echo {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Returns the sender feeding the log stream.
pub(crate) fn init(level: Level, echo: bool) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(LOG_CHANNEL_CAPACITY);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(LogMakeWriter {
            sender: log_tx.clone(),
            echo,
        })
        .finish();
    // A second init (tests, restarts) keeps the first subscriber.
    tracing::subscriber::set_global_default(subscriber).ok();
    log_tx
}
