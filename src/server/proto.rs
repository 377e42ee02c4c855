//! Wire protocol parsing.
//!
//! Every command is parsed into a validated structured request before the
//! scheduler is touched, so malformed input can never partially mutate
//! scheduler state.

use crate::core::job::JobRequest;
use crate::core::scheduler::MatchSpec;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("expected {expected} fields, got {got}")]
    WrongFieldCount { expected: usize, got: usize },
    #[error("invalid value '{value}' for field '{field}'")]
    InvalidField { field: &'static str, value: String },
}

/// One parsed request line.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    GetId,
    Submit(JobRequest),
    Finished(u32),
    Timeout(u32),
    Hold(u32),
    Release(u32),
    QInfo,
    QStat { verbose: bool },
    QDel,
}

/// One `specifier:pattern:user` line inside a `qdel` session.
#[derive(Debug, PartialEq, Eq)]
pub struct QdelLine {
    pub spec: MatchSpec,
    pub pattern: String,
    pub user: String,
}

fn parse_u32(field: &'static str, value: &str) -> Result<u32, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

pub fn parse_request(line: &str) -> Result<Request, ParseError> {
    let line = line.trim();
    let (command, rest) = match line.split_once(':') {
        Some((command, rest)) => (command, Some(rest)),
        None => (line, None),
    };

    match (command, rest) {
        ("get_id", None) => Ok(Request::GetId),
        ("qinfo", None) => Ok(Request::QInfo),
        ("qdel", None) => Ok(Request::QDel),
        ("qstat", Some("verbose")) => Ok(Request::QStat { verbose: true }),
        ("qstat", Some("terse")) => Ok(Request::QStat { verbose: false }),
        ("request", Some(fields)) => parse_submit(fields).map(Request::Submit),
        ("finished", Some(id)) => parse_u32("job_id", id).map(Request::Finished),
        ("timeout", Some(id)) => parse_u32("job_id", id).map(Request::Timeout),
        ("hold", Some(id)) => parse_u32("job_id", id).map(Request::Hold),
        ("release", Some(id)) => parse_u32("job_id", id).map(Request::Release),
        _ => Err(ParseError::UnknownCommand(line.to_string())),
    }
}

/// `job_id,host,port,name,threads,memory,n_gpus,hours,user,dep1+dep2+…`
fn parse_submit(fields: &str) -> Result<JobRequest, ParseError> {
    let parts: Vec<&str> = fields.split(',').collect();
    if parts.len() != 10 {
        return Err(ParseError::WrongFieldCount {
            expected: 10,
            got: parts.len(),
        });
    }

    let mut depends_on = std::collections::BTreeSet::new();
    if !parts[9].is_empty() {
        for dep in parts[9].split('+') {
            depends_on.insert(parse_u32("depends_on", dep)?);
        }
    }

    Ok(JobRequest {
        id: parse_u32("job_id", parts[0])?,
        host: parts[1].to_string(),
        port: parse_u32("port", parts[2])?
            .try_into()
            .map_err(|_| ParseError::InvalidField {
                field: "port",
                value: parts[2].to_string(),
            })?,
        name: parts[3].to_string(),
        threads: parse_u32("threads", parts[4])?,
        memory_mb: parse_u64("memory", parts[5])?,
        gpus: parse_u32("n_gpus", parts[6])?,
        hours: parse_u32("hours", parts[7])?,
        user: parts[8].to_string(),
        depends_on,
    })
}

pub fn parse_qdel_line(line: &str) -> Result<QdelLine, ParseError> {
    let parts: Vec<&str> = line.trim().splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(ParseError::WrongFieldCount {
            expected: 3,
            got: parts.len(),
        });
    }
    let spec = match parts[0] {
        "id" => MatchSpec::Id,
        "name" => MatchSpec::Name,
        other => {
            return Err(ParseError::InvalidField {
                field: "specifier",
                value: other.to_string(),
            })
        }
    };
    Ok(QdelLine {
        spec,
        pattern: parts[1].to_string(),
        user: parts[2].to_string(),
    })
}
