//! Command parsing and dispatch onto the queue store.

use super::resp::Reply;
use crate::engine::Error;
use crate::store::QueueStore;
use std::time::{Duration, Instant};
use tracing::debug;

/// A recognized client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Quit,
    /// `LLEN` without a name answers 0.
    Llen(Option<Vec<u8>>),
    Sadd {
        queue: Vec<u8>,
        payload: Vec<u8>,
        delay: Duration,
    },
    Spop {
        queue: Vec<u8>,
        count: usize,
    },
    Keys,
    Del(Vec<u8>),
}

impl Command {
    /// Parse request arguments. Argument errors come back as the reply to
    /// send.
    pub fn parse(mut args: Vec<Vec<u8>>) -> Result<Self, Reply> {
        if args.is_empty() {
            return Err(Reply::err("empty command"));
        }
        let name = args.remove(0);
        let mut args = args.into_iter();

        match name.to_ascii_lowercase().as_slice() {
            b"ping" => Ok(Self::Ping),
            b"quit" => Ok(Self::Quit),
            b"llen" => Ok(Self::Llen(args.next())),
            b"sadd" => {
                let queue = args.next().ok_or_else(|| Reply::err("queue name missing"))?;
                let payload = args
                    .next()
                    .ok_or_else(|| Reply::err("element and delay duration missing"))?;
                let delay = args
                    .next()
                    .ok_or_else(|| Reply::err("delay milliseconds missing"))?;
                Ok(Self::Sadd {
                    queue,
                    payload,
                    delay: parse_delay(&delay)?,
                })
            },
            b"spop" => {
                let queue = args.next().ok_or_else(|| Reply::err("queue name missing"))?;
                let count = match args.next() {
                    Some(count) => parse_count(&count)?,
                    None => 1,
                };
                Ok(Self::Spop { queue, count })
            },
            // Patterns are accepted and ignored.
            b"keys" => Ok(Self::Keys),
            b"del" => {
                let queue = args.next().ok_or_else(|| Reply::err("queue name missing"))?;
                Ok(Self::Del(queue))
            },
            _ => Err(Reply::err(format_args!(
                "unknown command '{}'",
                String::from_utf8_lossy(&name)
            ))),
        }
    }
}

fn parse_delay(raw: &[u8]) -> Result<Duration, Reply> {
    let millis: i64 = std::str::from_utf8(raw)
        .map_err(|e| Reply::err(format_args!("invalid delay duration: {e}")))?
        .parse()
        .map_err(|e| Reply::err(format_args!("invalid delay duration: {e}")))?;
    let millis = u64::try_from(millis)
        .map_err(|_| Reply::err(format_args!("invalid delay duration: {millis} is negative")))?;
    Ok(Duration::from_millis(millis))
}

/// Counts at or below zero pop nothing.
fn parse_count(raw: &[u8]) -> Result<usize, Reply> {
    let count: i64 = std::str::from_utf8(raw)
        .map_err(|e| Reply::err(format_args!("invalid count: {e}")))?
        .parse()
        .map_err(|e| Reply::err(format_args!("invalid count: {e}")))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Reply to send plus whether the connection should close afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Reply,
    pub close: bool,
}

impl From<Reply> for Outcome {
    fn from(reply: Reply) -> Self {
        Self {
            reply,
            close: false,
        }
    }
}

/// Run one request against the store.
pub async fn dispatch(store: &QueueStore, args: Vec<Vec<u8>>) -> Outcome {
    match Command::parse(args) {
        Ok(command) => execute(store, command).await,
        Err(reply) => reply.into(),
    }
}

async fn execute(store: &QueueStore, command: Command) -> Outcome {
    let started = Instant::now();
    let reply = match command {
        Command::Ping => Reply::Simple("PONG"),
        Command::Quit => {
            return Outcome {
                reply: Reply::Simple("OK"),
                close: true,
            };
        },
        Command::Llen(None) => Reply::Integer(0),
        Command::Llen(Some(queue)) => match store.len(&queue).await {
            Ok(len) => Reply::integer(len),
            Err(e) => error_reply(&e),
        },
        Command::Sadd {
            queue,
            payload,
            delay,
        } => {
            let result = store.push(&queue, &payload, delay).await;
            debug!(command = "sadd", elapsed = ?started.elapsed(), "Command finished");
            match result {
                Ok(()) => Reply::Integer(1),
                Err(e) => error_reply(&e),
            }
        },
        Command::Spop { queue, count } => {
            let result = store.pop(&queue, count).await;
            debug!(command = "spop", elapsed = ?started.elapsed(), "Command finished");
            match result {
                Ok(items) => Reply::Array(items),
                Err(e) => error_reply(&e),
            }
        },
        Command::Keys => match store.queues().await {
            Ok(names) => Reply::Array(names),
            Err(e) => error_reply(&e),
        },
        Command::Del(queue) => match store.del(&queue).await {
            Ok(removed) => Reply::integer(removed),
            Err(e) => error_reply(&e),
        },
    };
    reply.into()
}

/// Render an engine error with its source chain.
fn error_reply(error: &Error) -> Reply {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    Reply::err(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RedbOptions;
    use tempfile::TempDir;

    fn args(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    fn parse(words: &[&str]) -> Result<Command, Reply> {
        Command::parse(args(words))
    }

    #[test]
    fn test_commands_are_case_insensitive() {
        assert_eq!(parse(&["PiNg"]), Ok(Command::Ping));
        assert_eq!(parse(&["QUIT"]), Ok(Command::Quit));
        assert_eq!(parse(&["keys", "*"]), Ok(Command::Keys));
        assert_eq!(parse(&["Del", "q"]), Ok(Command::Del(b"q".to_vec())));
    }

    #[test]
    fn test_sadd_argument_errors() {
        assert_eq!(parse(&["sadd"]), Err(Reply::err("queue name missing")));
        assert_eq!(
            parse(&["sadd", "q"]),
            Err(Reply::err("element and delay duration missing"))
        );
        assert_eq!(
            parse(&["sadd", "q", "x"]),
            Err(Reply::err("delay milliseconds missing"))
        );
        assert!(matches!(
            parse(&["sadd", "q", "x", "soon"]),
            Err(Reply::Error(msg)) if msg.starts_with("ERR invalid delay duration: ")
        ));
        assert!(matches!(
            parse(&["sadd", "q", "x", "-5"]),
            Err(Reply::Error(msg)) if msg.starts_with("ERR invalid delay duration: ")
        ));
        assert_eq!(
            parse(&["sadd", "q", "x", "1500"]),
            Ok(Command::Sadd {
                queue: b"q".to_vec(),
                payload: b"x".to_vec(),
                delay: Duration::from_millis(1500),
            })
        );
    }

    #[test]
    fn test_spop_count() {
        let spop = |count| Command::Spop {
            queue: b"q".to_vec(),
            count,
        };
        assert_eq!(parse(&["spop", "q"]), Ok(spop(1)));
        assert_eq!(parse(&["spop", "q", "25"]), Ok(spop(25)));
        assert_eq!(parse(&["spop", "q", "0"]), Ok(spop(0)));
        assert_eq!(parse(&["spop", "q", "-3"]), Ok(spop(0)));
        assert!(matches!(
            parse(&["spop", "q", "many"]),
            Err(Reply::Error(msg)) if msg.starts_with("ERR invalid count: ")
        ));
        assert_eq!(parse(&["spop"]), Err(Reply::err("queue name missing")));
    }

    #[test]
    fn test_unknown_command_echoes_name() {
        assert_eq!(
            parse(&["FLUSHALL"]),
            Err(Reply::err("unknown command 'FLUSHALL'"))
        );
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = QueueStore::redb(RedbOptions::new(dir.path().join("h.redb")))?;

        let run = |words: &[&str]| dispatch(&store, args(words));
        assert_eq!(run(&["llen"]).await.reply, Reply::Integer(0));
        assert_eq!(run(&["sadd", "jobs", "a", "0"]).await.reply, Reply::Integer(1));
        assert_eq!(run(&["sadd", "jobs", "b", "60000"]).await.reply, Reply::Integer(1));
        assert_eq!(run(&["llen", "jobs"]).await.reply, Reply::Integer(2));
        assert_eq!(run(&["spop", "jobs", "0"]).await.reply, Reply::Array(Vec::new()));
        assert_eq!(
            run(&["spop", "jobs", "10"]).await.reply,
            Reply::Array(vec![b"a".to_vec()])
        );
        assert_eq!(run(&["keys"]).await.reply, Reply::Array(vec![b"jobs".to_vec()]));
        assert_eq!(run(&["del", "jobs"]).await.reply, Reply::Integer(1));
        assert_eq!(run(&["keys"]).await.reply, Reply::Array(Vec::new()));
        Ok(())
    }

    #[tokio::test]
    async fn test_quit_closes_and_engine_errors_become_replies() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = QueueStore::redb(RedbOptions::new(dir.path().join("h.redb")))?;

        let quit = dispatch(&store, args(&["quit"])).await;
        assert_eq!(quit.reply, Reply::Simple("OK"));
        assert!(quit.close);

        assert_eq!(
            dispatch(&store, args(&["sadd", "", "x", "0"])).await.reply,
            Reply::err("invalid argument: queue name must not be empty")
        );

        store.close().await?;
        assert_eq!(
            dispatch(&store, args(&["llen", "q"])).await,
            Outcome::from(Reply::err("engine is closed"))
        );
        Ok(())
    }
}
