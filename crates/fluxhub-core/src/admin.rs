//! Admin operations
//!
//! A closed set of operator commands over pre-parsed RESP arguments.
//! Parsing goes through a registration table from command name to
//! parser function; handling lives on the hub. Mutating commands are
//! only accepted while primary.

use crate::error::{Error, Result};
use crate::HEARTBEAT_PORT_DELTA;

/// Largest peer port that still leaves room for the heartbeat port.
const PORT_CEILING: u16 = u16::MAX - HEARTBEAT_PORT_DELTA;

/// One parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Ping,
    Info,
    Auth {
        password: String,
    },
    /// Register a new peer at `ip:port`
    Add {
        ip: String,
        port: u16,
    },
    /// Mark the peer at `ip:port` for removal
    Remove {
        ip: String,
        port: u16,
    },
    /// Move an existing peer to a new address and force a resync
    Transfer {
        server_id: i32,
        ip: String,
        port: u16,
    },
    /// Register a new peer cloned from an existing one's positions
    Copy {
        src_id: i32,
        new_id: i32,
        ip: String,
        port: u16,
        password: Option<String>,
    },
}

/// Reply to an admin command, rendered as RESP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminReply {
    Ok,
    Pong,
    Info(String),
    Err(String),
}

impl AdminReply {
    pub fn render(&self) -> Vec<u8> {
        match self {
            Self::Ok => b"+OK\r\n".to_vec(),
            Self::Pong => b"+PONG\r\n".to_vec(),
            Self::Info(text) => {
                let mut buf = format!("${}\r\n", text.len()).into_bytes();
                buf.extend_from_slice(text.as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf
            }
            Self::Err(msg) => format!("-ERR {}\r\n", msg).into_bytes(),
        }
    }
}

type ParseFn = fn(&[Vec<u8>]) -> Result<AdminCommand>;

/// Command registry: lowercase name to parser. Arity checks live in the
/// individual parsers.
const REGISTRY: &[(&str, ParseFn)] = &[
    ("ping", parse_ping),
    ("info", parse_info),
    ("auth", parse_auth),
    ("add", parse_add),
    ("remove", parse_remove),
    ("transfer", parse_transfer),
    ("copy", parse_copy),
];

/// Whether `name` is a registered admin command.
pub fn is_admin_command(name: &[u8]) -> bool {
    let name = name.to_ascii_lowercase();
    REGISTRY.iter().any(|(n, _)| n.as_bytes() == name)
}

/// Parse one admin command from its RESP arguments (name included).
pub fn parse_admin(args: &[Vec<u8>]) -> Result<AdminCommand> {
    let name = args
        .first()
        .ok_or_else(|| Error::protocol("empty command"))?
        .to_ascii_lowercase();
    let (_, parse) = REGISTRY
        .iter()
        .find(|(n, _)| n.as_bytes() == name)
        .ok_or_else(|| {
            Error::protocol(format!(
                "unknown command {:?}",
                String::from_utf8_lossy(&name)
            ))
        })?;
    parse(&args[1..])
}

fn expect_arity(args: &[Vec<u8>], want: usize, name: &str) -> Result<()> {
    if args.len() != want {
        return Err(Error::protocol(format!(
            "{} expects {} arguments, got {}",
            name,
            want,
            args.len()
        )));
    }
    Ok(())
}

fn arg_str(arg: &[u8]) -> Result<String> {
    String::from_utf8(arg.to_vec()).map_err(|_| Error::protocol("non-UTF-8 argument"))
}

fn arg_num<T: std::str::FromStr>(arg: &[u8], what: &str) -> Result<T> {
    arg_str(arg)?
        .parse()
        .map_err(|_| Error::protocol(format!("bad {} argument", what)))
}

fn arg_port(arg: &[u8]) -> Result<u16> {
    check_port(arg_num(arg, "port")?)
}

fn check_port(port: u16) -> Result<u16> {
    if port > PORT_CEILING {
        return Err(Error::protocol(format!(
            "port {} leaves no room for the heartbeat port (max {})",
            port, PORT_CEILING
        )));
    }
    Ok(port)
}

/// Split an `ip:port` address argument.
fn arg_addr(arg: &[u8]) -> Result<(String, u16)> {
    let addr = arg_str(arg)?;
    let (ip, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::protocol(format!("bad address {:?}", addr)))?;
    let port = port
        .parse()
        .map_err(|_| Error::protocol(format!("bad port in {:?}", addr)))?;
    Ok((ip.to_string(), check_port(port)?))
}

fn parse_ping(args: &[Vec<u8>]) -> Result<AdminCommand> {
    expect_arity(args, 0, "ping")?;
    Ok(AdminCommand::Ping)
}

fn parse_info(args: &[Vec<u8>]) -> Result<AdminCommand> {
    expect_arity(args, 0, "info")?;
    Ok(AdminCommand::Info)
}

fn parse_auth(args: &[Vec<u8>]) -> Result<AdminCommand> {
    expect_arity(args, 1, "auth")?;
    Ok(AdminCommand::Auth {
        password: arg_str(&args[0])?,
    })
}

fn parse_add(args: &[Vec<u8>]) -> Result<AdminCommand> {
    expect_arity(args, 1, "add")?;
    let (ip, port) = arg_addr(&args[0])?;
    Ok(AdminCommand::Add { ip, port })
}

fn parse_remove(args: &[Vec<u8>]) -> Result<AdminCommand> {
    expect_arity(args, 1, "remove")?;
    let (ip, port) = arg_addr(&args[0])?;
    Ok(AdminCommand::Remove { ip, port })
}

fn parse_transfer(args: &[Vec<u8>]) -> Result<AdminCommand> {
    expect_arity(args, 3, "transfer")?;
    Ok(AdminCommand::Transfer {
        server_id: arg_num(&args[0], "server id")?,
        ip: arg_str(&args[1])?,
        port: arg_port(&args[2])?,
    })
}

fn parse_copy(args: &[Vec<u8>]) -> Result<AdminCommand> {
    if !(4..=5).contains(&args.len()) {
        return Err(Error::protocol(format!(
            "copy expects 4 or 5 arguments, got {}",
            args.len()
        )));
    }
    Ok(AdminCommand::Copy {
        src_id: arg_num(&args[0], "source id")?,
        new_id: arg_num(&args[1], "new id")?,
        ip: arg_str(&args[2])?,
        port: arg_port(&args[3])?,
        password: args.get(4).map(|a| arg_str(a)).transpose()?,
    })
}
