use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init {
        bot_token: String,
        chat_id: String,
    },
    Push {
        path: PathBuf,
        name: Option<String>,
        replace: bool,
    },
    Pull {
        key: String,
        dest: Option<PathBuf>,
    },
    List,
    Delete {
        key: String,
    },
    Rename {
        key: String,
        new_name: String,
    },
    Status,
    Search {
        query: String,
    },
    Resume(ResumeAction),
    Mount {
        mountpoint: PathBuf,
    },
    Unmount {
        mountpoint: PathBuf,
    },
    Tag(TagAction),
    Sync(SyncAction),
    Verify {
        key: Option<String>,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    All,
    List,
    Clear(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAction {
    Add { key: String, tags: Vec<String> },
    Remove { key: String, tags: Vec<String> },
    List { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Add(PathBuf),
    Remove(PathBuf),
    Enable(PathBuf),
    Disable(PathBuf),
    List,
    Run,
    Watch,
}

pub const USAGE: &str = "\
Usage: tgvault <command> [args]

Commands:
  init <bot-token> <chat-id>        link a bot chat (password from TGVAULT_PASSWORD)
  push <path> [--name N] [--replace]
  pull <name|hash> [dest]
  list
  delete <name|hash>
  rename <name|hash> <new-name>
  status
  search <query>
  resume [--list | --clear <id>]
  mount <dir>
  unmount <dir>
  tag add <name|hash> <tag>...
  tag remove <name|hash> <tag>...
  tag list <name|hash>
  sync add|remove|enable|disable <dir>
  sync list | run | watch
  verify [name|hash]
";

/// Parses `argv` including the program name.
pub fn parse_command<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };
    let rest: Vec<String> = args.collect();

    let parsed = match command.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "init" => {
            let [bot_token, chat_id] = exactly(&command, rest)?;
            Command::Init { bot_token, chat_id }
        }
        "push" => parse_push(rest)?,
        "pull" => match rest.len() {
            1 | 2 => {
                let mut rest = rest.into_iter();
                Command::Pull {
                    key: next_arg(&mut rest, "pull")?,
                    dest: rest.next().map(PathBuf::from),
                }
            }
            _ => anyhow::bail!("usage: tgvault pull <name|hash> [dest]"),
        },
        "list" | "ls" => {
            let [] = exactly(&command, rest)?;
            Command::List
        }
        "delete" | "rm" => {
            let [key] = exactly(&command, rest)?;
            Command::Delete { key }
        }
        "rename" | "mv" => {
            let [key, new_name] = exactly(&command, rest)?;
            Command::Rename { key, new_name }
        }
        "status" => {
            let [] = exactly(&command, rest)?;
            Command::Status
        }
        "search" => {
            anyhow::ensure!(!rest.is_empty(), "usage: tgvault search <query>");
            Command::Search {
                query: rest.join(" "),
            }
        }
        "resume" => Command::Resume(parse_resume(rest)?),
        "mount" => {
            let [dir] = exactly(&command, rest)?;
            Command::Mount {
                mountpoint: PathBuf::from(dir),
            }
        }
        "unmount" | "umount" => {
            let [dir] = exactly(&command, rest)?;
            Command::Unmount {
                mountpoint: PathBuf::from(dir),
            }
        }
        "tag" => Command::Tag(parse_tag(rest)?),
        "sync" => Command::Sync(parse_sync(rest)?),
        "verify" => match rest.len() {
            0 | 1 => Command::Verify {
                key: rest.into_iter().next(),
            },
            _ => anyhow::bail!("usage: tgvault verify [name|hash]"),
        },
        other => anyhow::bail!("unknown command: {other}"),
    };
    Ok(parsed)
}

fn parse_push(rest: Vec<String>) -> anyhow::Result<Command> {
    let mut path = None;
    let mut name = None;
    let mut replace = false;
    let mut args = rest.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--name" => name = Some(next_arg(&mut args, "--name")?),
            "--replace" => replace = true,
            flag if flag.starts_with("--") => anyhow::bail!("unknown push option: {flag}"),
            _ if path.is_none() => path = Some(PathBuf::from(arg)),
            _ => anyhow::bail!("push takes a single path"),
        }
    }
    let path = path.ok_or_else(|| anyhow::anyhow!("usage: tgvault push <path> [--name N] [--replace]"))?;
    Ok(Command::Push {
        path,
        name,
        replace,
    })
}

fn parse_resume(rest: Vec<String>) -> anyhow::Result<ResumeAction> {
    let mut args = rest.into_iter();
    let action = match args.next().as_deref() {
        None => ResumeAction::All,
        Some("--list") => ResumeAction::List,
        Some("--clear") => {
            let id = next_arg(&mut args, "--clear")?;
            let id = id
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("--clear expects a numeric id, got {id:?}"))?;
            ResumeAction::Clear(id)
        }
        Some(other) => anyhow::bail!("unknown resume option: {other}"),
    };
    anyhow::ensure!(args.next().is_none(), "too many arguments for resume");
    Ok(action)
}

fn parse_tag(rest: Vec<String>) -> anyhow::Result<TagAction> {
    let mut args = rest.into_iter();
    let sub = next_arg(&mut args, "tag")?;
    let key = next_arg(&mut args, &format!("tag {sub}"))?;
    let tags: Vec<String> = args.collect();
    match sub.as_str() {
        "add" | "remove" | "rm" if tags.is_empty() => {
            anyhow::bail!("usage: tgvault tag {sub} <name|hash> <tag>...")
        }
        "add" => Ok(TagAction::Add { key, tags }),
        "remove" | "rm" => Ok(TagAction::Remove { key, tags }),
        "list" | "ls" if tags.is_empty() => Ok(TagAction::List { key }),
        "list" | "ls" => anyhow::bail!("usage: tgvault tag list <name|hash>"),
        other => anyhow::bail!("unknown tag subcommand: {other}"),
    }
}

fn parse_sync(rest: Vec<String>) -> anyhow::Result<SyncAction> {
    let mut args = rest.into_iter();
    let sub = next_arg(&mut args, "sync")?;
    let action = match sub.as_str() {
        "add" => SyncAction::Add(PathBuf::from(next_arg(&mut args, "sync add")?)),
        "remove" | "rm" => SyncAction::Remove(PathBuf::from(next_arg(&mut args, "sync remove")?)),
        "enable" => SyncAction::Enable(PathBuf::from(next_arg(&mut args, "sync enable")?)),
        "disable" => SyncAction::Disable(PathBuf::from(next_arg(&mut args, "sync disable")?)),
        "list" | "ls" => SyncAction::List,
        "run" => SyncAction::Run,
        "watch" => SyncAction::Watch,
        other => anyhow::bail!("unknown sync subcommand: {other}"),
    };
    anyhow::ensure!(args.next().is_none(), "too many arguments for sync {sub}");
    Ok(action)
}

fn next_arg(args: &mut impl Iterator<Item = String>, after: &str) -> anyhow::Result<String> {
    args.next()
        .ok_or_else(|| anyhow::anyhow!("missing argument after `{after}`"))
}

fn exactly<const N: usize>(command: &str, rest: Vec<String>) -> anyhow::Result<[String; N]> {
    let got = rest.len();
    rest.try_into()
        .map_err(|_| anyhow::anyhow!("`{command}` expects {N} argument(s), got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> anyhow::Result<Command> {
        parse_command(
            std::iter::once("tgvault".to_string()).chain(line.split_whitespace().map(String::from)),
        )
    }

    #[test]
    fn no_arguments_prints_help() {
        assert_eq!(parse("").unwrap(), Command::Help);
        assert_eq!(parse("--help").unwrap(), Command::Help);
    }

    #[test]
    fn push_accepts_name_and_replace_in_any_order() {
        assert_eq!(
            parse("push --replace ./a.txt --name notes.txt").unwrap(),
            Command::Push {
                path: PathBuf::from("./a.txt"),
                name: Some("notes.txt".into()),
                replace: true,
            }
        );
        assert!(parse("push").is_err());
        assert!(parse("push a b").is_err());
        assert!(parse("push a --force").is_err());
    }

    #[test]
    fn pull_with_optional_destination() {
        assert_eq!(
            parse("pull report.pdf").unwrap(),
            Command::Pull {
                key: "report.pdf".into(),
                dest: None
            }
        );
        assert_eq!(
            parse("pull report.pdf /tmp/r.pdf").unwrap(),
            Command::Pull {
                key: "report.pdf".into(),
                dest: Some(PathBuf::from("/tmp/r.pdf"))
            }
        );
    }

    #[test]
    fn resume_flags() {
        assert_eq!(parse("resume").unwrap(), Command::Resume(ResumeAction::All));
        assert_eq!(
            parse("resume --list").unwrap(),
            Command::Resume(ResumeAction::List)
        );
        assert_eq!(
            parse("resume --clear 7").unwrap(),
            Command::Resume(ResumeAction::Clear(7))
        );
        assert!(parse("resume --clear seven").is_err());
        assert!(parse("resume --clear").is_err());
    }

    #[test]
    fn tag_subcommands() {
        assert_eq!(
            parse("tag add report.pdf work finance").unwrap(),
            Command::Tag(TagAction::Add {
                key: "report.pdf".into(),
                tags: vec!["work".into(), "finance".into()],
            })
        );
        assert_eq!(
            parse("tag list report.pdf").unwrap(),
            Command::Tag(TagAction::List {
                key: "report.pdf".into()
            })
        );
        assert!(parse("tag add report.pdf").is_err());
        assert!(parse("tag frob report.pdf x").is_err());
    }

    #[test]
    fn sync_subcommands() {
        assert_eq!(
            parse("sync add /home/me/docs").unwrap(),
            Command::Sync(SyncAction::Add(PathBuf::from("/home/me/docs")))
        );
        assert_eq!(parse("sync run").unwrap(), Command::Sync(SyncAction::Run));
        assert_eq!(parse("sync watch").unwrap(), Command::Sync(SyncAction::Watch));
        assert!(parse("sync add").is_err());
        assert!(parse("sync list extra").is_err());
    }

    #[test]
    fn arity_is_checked() {
        assert!(parse("init token").is_err());
        assert!(parse("delete").is_err());
        assert!(parse("list extra").is_err());
        assert!(parse("frobnicate").is_err());
        assert_eq!(
            parse("search quarterly report").unwrap(),
            Command::Search {
                query: "quarterly report".into()
            }
        );
    }
}
