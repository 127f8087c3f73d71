//! Interactive command parsing and dispatch.

use anyhow::{anyhow, bail, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::controller::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Update,
    LocateHash { hash: String },
    LocateName { name: String },
    LocateHashWithName { name: String },
    CheckStatus { host: String },
    UpdateStatus { status: u8 },
    Get { hash: String, name: Option<String> },
    Join { name: String, division_size: Option<u16> },
    Leave,
    Help,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Update,
    LocateHash,
    LocateName,
    LocateHashWithName,
    CheckStatus,
    UpdateStatus,
    Get,
    Join,
    Leave,
    Help,
}

/// Spellings of every command. Longer spellings come first so
/// "locate hash with name" wins over "locate hash".
const TABLE: &[(&[&str], Kind)] = &[
    (&["locate", "hash", "with", "name"], Kind::LocateHashWithName),
    (&["locate", "hash"], Kind::LocateHash),
    (&["locate", "name"], Kind::LocateName),
    (&["check", "status"], Kind::CheckStatus),
    (&["update", "status"], Kind::UpdateStatus),
    (&["join", "blocks"], Kind::Join),
    (&["update"], Kind::Update),
    (&["get"], Kind::Get),
    (&["leave"], Kind::Leave),
    (&["help"], Kind::Help),
    (&["lhn"], Kind::LocateHashWithName),
    (&["lh"], Kind::LocateHash),
    (&["ln"], Kind::LocateName),
    (&["cs"], Kind::CheckStatus),
    (&["us"], Kind::UpdateStatus),
    (&["jbb"], Kind::Join),
    (&["u"], Kind::Update),
    (&["g"], Kind::Get),
    (&["l"], Kind::Leave),
    (&["h"], Kind::Help),
];

pub const HELP: &str = "\
commands:
  update | u                                 divide local files and report holdings
  locate hash | lh <hash>                    peers holding a file
  locate name | ln <name>                    hashes and hosts for a file name
  locate hash with name | lhn <name>         locate name, then every hash found
  check status | cs <host>                   status flag of a node
  update status | us <status>                set this node's status flag (0-255)
  get | g <hash> [name]                      download the blocks this node lacks
  join blocks | jbb <name> [division_size]   reassemble a downloaded file
  leave | l                                  leave the network and exit
  help | h                                   this text";

/// Parse one input line. `None` for a blank line.
pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    let (kind, args) = TABLE
        .iter()
        .find(|(spelling, _)| {
            words.len() >= spelling.len()
                && spelling
                    .iter()
                    .zip(&words)
                    .all(|(s, w)| s.eq_ignore_ascii_case(w))
        })
        .map(|(spelling, kind)| (*kind, &words[spelling.len()..]))
        .ok_or_else(|| anyhow!("unknown command {:?}, try help", words[0]))?;

    let command = match kind {
        Kind::Update => Command::Update,
        Kind::LocateHash => Command::LocateHash {
            hash: one(args, "hash")?,
        },
        Kind::LocateName => Command::LocateName {
            name: one(args, "name")?,
        },
        Kind::LocateHashWithName => Command::LocateHashWithName {
            name: one(args, "name")?,
        },
        Kind::CheckStatus => Command::CheckStatus {
            host: one(args, "host")?,
        },
        Kind::UpdateStatus => Command::UpdateStatus {
            status: one(args, "status")?
                .parse()
                .context("status must be 0-255")?,
        },
        Kind::Get => match args {
            [hash] => Command::Get {
                hash: hash.to_string(),
                name: None,
            },
            [hash, name] => Command::Get {
                hash: hash.to_string(),
                name: Some(name.to_string()),
            },
            _ => bail!("usage: get <hash> [name]"),
        },
        Kind::Join => match args {
            [name] => Command::Join {
                name: name.to_string(),
                division_size: None,
            },
            [name, size] => Command::Join {
                name: name.to_string(),
                division_size: Some(size.parse().context("division size must be a number")?),
            },
            _ => bail!("usage: join blocks <name> [division_size]"),
        },
        Kind::Leave => Command::Leave,
        Kind::Help => Command::Help,
    };
    Ok(Some(command))
}

fn one(args: &[&str], what: &str) -> anyhow::Result<String> {
    match args {
        [value] => Ok(value.to_string()),
        _ => bail!("expected exactly one {what}"),
    }
}

/// What running a command produced.
#[derive(Debug)]
pub struct Outcome {
    pub output: Value,
    /// The node left the network; the command loop should stop.
    pub quit: bool,
}

impl Outcome {
    fn show(output: Value) -> Self {
        Self {
            output,
            quit: false,
        }
    }
}

pub async fn execute<S>(node: &mut Node<S>, command: Command) -> anyhow::Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let output = match command {
        Command::Update => serde_json::to_value(node.update().await?)?,
        Command::LocateHash { hash } => serde_json::to_value(node.locate_hash(&hash).await?)?,
        Command::LocateName { name } => {
            let (status, matches) = node.locate_name(&name).await?;
            json!({ "status": status, "matches": matches })
        }
        Command::LocateHashWithName { name } => {
            serde_json::to_value(node.locate_hash_with_name(&name).await?)?
        }
        Command::CheckStatus { host } => {
            let (status, node_status) = node.check_status(&host).await?;
            json!({ "status": status, "host": host, "node_status": node_status })
        }
        Command::UpdateStatus { status } => {
            json!({ "status": node.update_status(status).await? })
        }
        Command::Get { hash, name } => {
            serde_json::to_value(node.get(&hash, name.as_deref()).await?)?
        }
        Command::Join {
            name,
            division_size,
        } => {
            let hash = node.join(&name, division_size)?;
            json!({ "file": name, "hash": hash })
        }
        Command::Leave => {
            let status = node.leave().await?;
            return Ok(Outcome {
                output: json!({ "status": status }),
                quit: true,
            });
        }
        Command::Help => Value::String(HELP.to_string()),
    };
    Ok(Outcome::show(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_and_long_forms_agree() {
        assert_eq!(parse("u").unwrap(), Some(Command::Update));
        assert_eq!(parse("update").unwrap(), Some(Command::Update));
        assert_eq!(
            parse("lh abc").unwrap(),
            parse("locate hash abc").unwrap()
        );
        assert_eq!(
            parse("ln report.pdf").unwrap(),
            Some(Command::LocateName { name: "report.pdf".into() })
        );
        assert_eq!(
            parse("locate hash with name report.pdf").unwrap(),
            Some(Command::LocateHashWithName { name: "report.pdf".into() })
        );
        assert_eq!(parse("lhn x").unwrap(), parse("locate hash with name x").unwrap());
        assert_eq!(parse("cs node1").unwrap(), Some(Command::CheckStatus { host: "node1".into() }));
        assert_eq!(parse("l").unwrap(), Some(Command::Leave));
        assert_eq!(parse("H").unwrap(), Some(Command::Help));
    }

    #[test]
    fn test_update_status_vs_update() {
        assert_eq!(parse("update status 3").unwrap(), Some(Command::UpdateStatus { status: 3 }));
        assert_eq!(parse("us 255").unwrap(), Some(Command::UpdateStatus { status: 255 }));
        assert!(parse("us 256").is_err());
    }

    #[test]
    fn test_get_and_join_arguments() {
        assert_eq!(
            parse("g abc").unwrap(),
            Some(Command::Get { hash: "abc".into(), name: None })
        );
        assert_eq!(
            parse("get abc report.pdf").unwrap(),
            Some(Command::Get { hash: "abc".into(), name: Some("report.pdf".into()) })
        );
        assert_eq!(
            parse("jbb report.pdf 256").unwrap(),
            Some(Command::Join { name: "report.pdf".into(), division_size: Some(256) })
        );
        assert!(parse("jbb").is_err());
        assert!(parse("g").is_err());
    }

    #[test]
    fn test_blank_and_unknown() {
        assert_eq!(parse("   ").unwrap(), None);
        assert!(parse("frobnicate").is_err());
        assert!(parse("lh").is_err());
    }
}
