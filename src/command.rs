//! # Operator Commands
//!
//! Parses `log` command lines such as `log download range 3 7`.

use std::str::FromStr;

use crate::error::LogDumpError;

/// Usage line for the `log` command
pub const USAGE: &str = "usage: log <list|download|erase|dump|resume|status|cancel>";

/// Usage line for `log download`
pub const DOWNLOAD_USAGE: &str = "usage: log download all | log download latest [filename] | \
     log download <lognumber> [filename] | log download from <lognumber> | \
     log download range FIRST LAST";

/// What to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// Every catalog entry
    All,
    /// The newest catalog entry
    Latest { filename: Option<String> },
    /// Every catalog entry except the `n` oldest
    From(usize),
    /// Ids `first..=last`
    Range { first: u16, last: u16 },
    /// One log
    Single { log_id: u16, filename: Option<String> },
}

/// Parsed `log` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCommand {
    List,
    Status,
    Erase,
    Dump,
    Resume,
    Cancel,
    Download(DownloadTarget),
}

fn invalid(usage: &str) -> LogDumpError {
    LogDumpError::InvalidCommand(usage.to_string())
}

fn parse_number<T: FromStr>(arg: &str, usage: &str) -> Result<T, LogDumpError> {
    arg.parse()
        .map_err(|_| LogDumpError::InvalidCommand(format!("'{}' is not a valid number; {}", arg, usage)))
}

fn parse_download(args: &[&str]) -> Result<DownloadTarget, LogDumpError> {
    let Some(&what) = args.first() else {
        return Err(invalid(DOWNLOAD_USAGE));
    };
    let filename = args.get(1).map(|s| s.to_string());

    match what {
        "all" => Ok(DownloadTarget::All),
        "latest" => Ok(DownloadTarget::Latest { filename }),
        "from" => {
            let skip = match args.get(1) {
                Some(n) => parse_number(n, DOWNLOAD_USAGE)?,
                None => 0,
            };
            Ok(DownloadTarget::From(skip))
        }
        "range" => {
            const RANGE_USAGE: &str = "usage: log download range FIRST LAST";
            let (Some(first), Some(last)) = (args.get(1), args.get(2)) else {
                return Err(invalid(RANGE_USAGE));
            };
            let first: u16 = parse_number(first, RANGE_USAGE)?;
            let last: u16 = parse_number(last, RANGE_USAGE)?;
            if first > last {
                return Err(LogDumpError::InvalidCommand(format!(
                    "range start {} is after range end {}",
                    first, last
                )));
            }
            Ok(DownloadTarget::Range { first, last })
        }
        id => Ok(DownloadTarget::Single {
            log_id: parse_number(id, DOWNLOAD_USAGE)?,
            filename,
        }),
    }
}

impl FromStr for LogCommand {
    type Err = LogDumpError;

    /// Parse a command line, with or without the leading `log`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut args: Vec<&str> = line.split_whitespace().collect();
        if args.first() == Some(&"log") {
            args.remove(0);
        }

        let Some((&sub, rest)) = args.split_first() else {
            return Err(invalid(USAGE));
        };

        match sub {
            "list" => Ok(LogCommand::List),
            "status" => Ok(LogCommand::Status),
            "erase" => Ok(LogCommand::Erase),
            "dump" => Ok(LogCommand::Dump),
            "resume" => Ok(LogCommand::Resume),
            "cancel" => Ok(LogCommand::Cancel),
            "download" => parse_download(rest).map(LogCommand::Download),
            _ => Err(invalid(USAGE)),
        }
    }
}
