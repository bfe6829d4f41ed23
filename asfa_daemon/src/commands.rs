use asfa_core::AppCommand;
use asfa_core::browser::BrowseDirection;
use asfa_core::ftps::Credentials;
use asfa_core::jobs::{Operation, QueueKind};
use std::collections::HashSet;
use std::path::PathBuf;

pub const HELP: &str = "\
commands:
  copy <src> <dst>                 move <src> <dst>
  folder <copy|move> <src> <dst> [recurse] [ignore=.ext,.ext]
  download <name> <size> [remote dir]
  cancel <transfers|downloads> <id>
  cancel-all <transfers|downloads>  cleanup <transfers|downloads>
  progress <transfers|downloads>
  authorize <user> <password> <root>   revoke <user>
  bandwidth <bytes per second>     start | stop
  connect <user> <password> <host> <port>
  ls | cd <folder> | back
  quit";

fn queue(arg: Option<&str>) -> Result<QueueKind, String> {
    match arg {
        Some("transfers") => Ok(QueueKind::Transfers),
        Some("downloads") => Ok(QueueKind::Downloads),
        _ => Err("expected 'transfers' or 'downloads'".to_string()),
    }
}

fn operation(arg: Option<&str>) -> Result<Operation, String> {
    match arg {
        Some("copy") => Ok(Operation::Copy),
        Some("move") => Ok(Operation::Move),
        _ => Err("expected 'copy' or 'move'".to_string()),
    }
}

fn number<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<T, String> {
    arg.and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("expected {}", what))
}

/// Parse one stdin line. Arguments are whitespace separated.
pub fn parse_command(line: &str) -> Result<AppCommand, String> {
    let mut args = line.split_whitespace();
    let Some(verb) = args.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = args.collect();
    let arg = |i: usize| args.get(i).copied();
    let path = |i: usize| {
        arg(i)
            .map(PathBuf::from)
            .ok_or_else(|| format!("'{}' needs more arguments", verb))
    };

    let command = match verb {
        "copy" => AppCommand::EnqueueCopy {
            source: path(0)?,
            destination: path(1)?,
        },
        "move" => AppCommand::EnqueueMove {
            source: path(0)?,
            destination: path(1)?,
        },
        "folder" => {
            let mut recurse = false;
            let mut ignored_extensions = HashSet::new();
            for option in args.iter().skip(3) {
                if *option == "recurse" {
                    recurse = true;
                } else if let Some(list) = option.strip_prefix("ignore=") {
                    ignored_extensions.extend(
                        list.split(',')
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_lowercase()),
                    );
                } else {
                    return Err(format!("unknown option '{}'", option));
                }
            }
            AppCommand::EnqueueFolder {
                operation: operation(arg(0))?,
                source: path(1)?,
                destination: path(2)?,
                recurse,
                ignored_extensions,
            }
        }
        "download" => AppCommand::EnqueueDownload {
            remote_name: arg(0).ok_or("expected a file name")?.to_string(),
            size: number(arg(1), "a size in bytes")?,
            remote_dir: arg(2).unwrap_or_default().to_string(),
            credentials: None,
        },
        "cancel" => AppCommand::Cancel {
            queue: queue(arg(0))?,
            job_id: arg(1).ok_or("expected a job id")?.to_string(),
        },
        "cancel-all" => AppCommand::CancelAll {
            queue: queue(arg(0))?,
        },
        "cleanup" => AppCommand::CleanupDisplay {
            queue: queue(arg(0))?,
        },
        "progress" => AppCommand::QueryProgress {
            queue: queue(arg(0))?,
        },
        "authorize" => AppCommand::AuthorizeUser {
            username: arg(0).ok_or("expected a username")?.to_string(),
            password: arg(1).ok_or("expected a password")?.to_string(),
            root: path(2)?,
        },
        "revoke" => AppCommand::RevokeUser {
            username: arg(0).ok_or("expected a username")?.to_string(),
        },
        "bandwidth" => AppCommand::SetBandwidth {
            bytes_per_sec: number(arg(0), "bytes per second")?,
        },
        "start" => AppCommand::StartServer,
        "stop" => AppCommand::StopServer,
        "connect" => AppCommand::Connect {
            credentials: Credentials::new(
                arg(0).ok_or("expected a username")?,
                arg(1).ok_or("expected a password")?,
                arg(2).ok_or("expected a host")?,
                number(arg(3), "a port")?,
            ),
        },
        "ls" => AppCommand::Browse {
            path: String::new(),
            direction: BrowseDirection::Refresh,
        },
        "cd" => AppCommand::Browse {
            path: arg(0).ok_or("expected a folder")?.to_string(),
            direction: BrowseDirection::Forward,
        },
        "back" => AppCommand::Browse {
            path: String::new(),
            direction: BrowseDirection::Back,
        },
        "quit" | "exit" => AppCommand::Shutdown,
        other => return Err(format!("unknown command '{}'", other)),
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transfers() {
        assert_eq!(
            parse_command("copy /a/b.txt /c").unwrap(),
            AppCommand::EnqueueCopy {
                source: "/a/b.txt".into(),
                destination: "/c".into(),
            }
        );
        assert_eq!(
            parse_command("folder move /music /backup recurse ignore=.JPG,.ini").unwrap(),
            AppCommand::EnqueueFolder {
                source: "/music".into(),
                destination: "/backup".into(),
                operation: Operation::Move,
                recurse: true,
                ignored_extensions: HashSet::from([".jpg".to_string(), ".ini".to_string()]),
            }
        );
        assert_eq!(
            parse_command("download song.mp3 2048 music/rock").unwrap(),
            AppCommand::EnqueueDownload {
                remote_name: "song.mp3".into(),
                remote_dir: "music/rock".into(),
                size: 2048,
                credentials: None,
            }
        );
    }

    #[test]
    fn test_parse_server_and_browse() {
        assert_eq!(parse_command("start").unwrap(), AppCommand::StartServer);
        assert_eq!(
            parse_command("bandwidth 1048576").unwrap(),
            AppCommand::SetBandwidth {
                bytes_per_sec: 1_048_576
            }
        );
        assert_eq!(
            parse_command("connect bob pw 192.168.1.5 3000").unwrap(),
            AppCommand::Connect {
                credentials: Credentials::new("bob", "pw", "192.168.1.5", 3000)
            }
        );
        assert_eq!(
            parse_command("back").unwrap(),
            AppCommand::Browse {
                path: String::new(),
                direction: BrowseDirection::Back
            }
        );
        assert_eq!(parse_command("  quit  ").unwrap(), AppCommand::Shutdown);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("").is_err());
        assert!(parse_command("copy /only-one").is_err());
        assert!(parse_command("cancel uploads 1").is_err());
        assert!(parse_command("bandwidth fast").is_err());
        assert!(parse_command("folder copy /a /b sideways").is_err());
        assert!(parse_command("dance").is_err());
    }
}
