use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};

const DEFAULT_CONFIG_FILE: &str = "creditsync.jsonc";
const USAGE: &str = "usage: creditsync [config-path] [balance | deduct <amount> | add <amount> [user-id] | watch]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Balance,
    Deduct { amount: u64 },
    Add { amount: u64, target_user: Option<String> },
    Watch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub command: Command,
}

pub fn args_from_env() -> Result<CliArgs> {
    let cwd = env::current_dir()?;
    parse_args(env::args().skip(1), &cwd)
}

pub fn parse_args<I>(args: I, cwd: &Path) -> Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().peekable();

    let config_path = match args.peek() {
        Some(first) if !is_command(first) => {
            let path = PathBuf::from(first);
            args.next();
            path
        }
        _ => cwd.join(DEFAULT_CONFIG_FILE),
    };

    let command = match args.next().as_deref() {
        None | Some("balance") => Command::Balance,
        Some("watch") => Command::Watch,
        Some("deduct") => Command::Deduct {
            amount: parse_amount(args.next())?,
        },
        Some("add") => Command::Add {
            amount: parse_amount(args.next())?,
            target_user: args.next(),
        },
        Some(other) => bail!("unknown command '{}'. {}", other, USAGE),
    };

    if let Some(extra) = args.next() {
        bail!("unexpected argument '{}'. {}", extra, USAGE);
    }

    Ok(CliArgs {
        config_path,
        command,
    })
}

fn is_command(arg: &str) -> bool {
    matches!(arg, "balance" | "deduct" | "add" | "watch")
}

fn parse_amount(raw: Option<String>) -> Result<u64> {
    let raw = raw.ok_or_else(|| anyhow!("missing amount. {}", USAGE))?;
    raw.parse::<u64>()
        .with_context(|| format!("invalid amount '{}'", raw))
}
