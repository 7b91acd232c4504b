//! Command-line surface, lowered into a validated [`Config`].

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};

use crate::error::FatalError;
use crate::policy::{Acceptance, Policy};

#[derive(Debug, Parser)]
#[command(name = "ampr-ripd", about = "RIPv2 reconciliation daemon for AMPR tunnel meshes")]
pub struct Cli {
    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'd', long)]
    pub no_daemonize: bool,

    /// Discover existing kernel state, print it, and exit.
    #[arg(short = 'D', long)]
    pub dump: bool,

    /// Routing domain used for tunnel creation and route mutation.
    #[arg(short = 'T', long, default_value_t = 44)]
    pub create_rtable: u32,

    /// Routing domain the RIP listener binds in.
    #[arg(short = 'B', long, default_value_t = 44)]
    pub bind_rtable: u32,

    /// Add a prefix to the acceptance policy as Ignore (net/len, repeatable).
    #[arg(short = 'I', long = "ignore", value_name = "NET/LEN")]
    pub ignore: Vec<String>,

    /// Add a prefix to the acceptance policy as Accept (net/len, repeatable).
    #[arg(short = 'A', long = "accept", value_name = "NET/LEN")]
    pub accept: Vec<String>,

    /// Reserve a tunnel interface number so discovery never touches it.
    #[arg(short = 's', long = "static", value_name = "IFNUM")]
    pub static_ifnum: Vec<usize>,

    /// Replay raw RIP datagrams from a file instead of the multicast socket.
    #[arg(short = 'f', long, value_name = "PATH")]
    pub replay_file: Option<PathBuf>,

    /// Shared plaintext RIPv2 authentication password.
    #[arg(long, env = "AMPR_RIPD_PASSWORD")]
    pub password: String,

    /// Local outer (public) IPv4 address.
    pub local_outer: Ipv4Addr,

    /// Local inner (mesh) IPv4 address.
    pub local_inner: Ipv4Addr,

    /// `-A`/`-I` specs in their true left-to-right command-line order.
    /// Populated by [`Cli::parse_ordered`], not by clap itself: the derive
    /// API splits repeated flags into one `Vec` per flag name, which loses
    /// the relative order between `-A` and `-I` occurrences.
    #[arg(skip)]
    policy_order: Vec<(Policy, String)>,
}

pub struct Config {
    pub daemonize: bool,
    pub dump: bool,
    pub create_rtable: u32,
    pub bind_rtable: u32,
    pub acceptance: Acceptance,
    pub static_ifnums: Vec<usize>,
    pub replay_file: Option<PathBuf>,
    pub password: [u8; 16],
    pub local_outer: Ipv4Addr,
    pub local_inner: Ipv4Addr,
}

impl Cli {
    /// Parses `std::env::args_os()`, like [`Parser::parse`], but also
    /// recovers the true interleaving order of `-A`/`-I` flags so
    /// first-definition-wins semantics match what was actually typed.
    pub fn parse_ordered() -> Self {
        let matches = Self::command().get_matches();
        Self::from_matches_ordered(matches)
    }

    fn from_matches_ordered(matches: ArgMatches) -> Self {
        let policy_order = policy_order(&matches);
        let mut cli = Self::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
        cli.policy_order = policy_order;
        cli
    }

    pub fn into_config(self) -> Result<Config, FatalError> {
        let mut acceptance = Acceptance::new();
        for (policy, spec) in &self.policy_order {
            let (net, len) = parse_net(spec)?;
            acceptance.add(net, len, *policy);
        }

        let mut password = [0u8; 16];
        let bytes = self.password.as_bytes();
        if bytes.len() > 16 {
            return Err(FatalError::InvalidArgument(
                "password exceeds 16 bytes".into(),
            ));
        }
        password[..bytes.len()].copy_from_slice(bytes);

        Ok(Config {
            daemonize: !self.no_daemonize,
            dump: self.dump,
            create_rtable: self.create_rtable,
            bind_rtable: self.bind_rtable,
            acceptance,
            static_ifnums: self.static_ifnum,
            replay_file: self.replay_file,
            password,
            local_outer: self.local_outer,
            local_inner: self.local_inner,
        })
    }
}

/// Merges the `-I`/`-A` occurrences back into one list ordered by the index
/// each occurrence had on the original command line.
fn policy_order(matches: &ArgMatches) -> Vec<(Policy, String)> {
    let ignore = matches
        .indices_of("ignore")
        .into_iter()
        .flatten()
        .zip(matches.get_many::<String>("ignore").into_iter().flatten().cloned())
        .map(|(i, spec)| (i, Policy::Ignore, spec));
    let accept = matches
        .indices_of("accept")
        .into_iter()
        .flatten()
        .zip(matches.get_many::<String>("accept").into_iter().flatten().cloned())
        .map(|(i, spec)| (i, Policy::Accept, spec));

    let mut combined: Vec<_> = ignore.chain(accept).collect();
    combined.sort_by_key(|(index, _, _)| *index);
    combined.into_iter().map(|(_, policy, spec)| (policy, spec)).collect()
}

fn parse_net(spec: &str) -> Result<(Ipv4Addr, u8), FatalError> {
    let (net, len) = spec
        .split_once('/')
        .ok_or_else(|| FatalError::InvalidArgument(format!("{spec:?} is not in net/len form")))?;
    let net: Ipv4Addr = net
        .parse()
        .map_err(|_| FatalError::InvalidArgument(format!("{net:?} is not a valid IPv4 address")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| FatalError::InvalidArgument(format!("{len:?} is not a valid prefix length")))?;
    if len > 32 {
        return Err(FatalError::InvalidArgument(format!(
            "prefix length {len} exceeds 32"
        )));
    }
    Ok((net, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_net_spec() {
        assert_eq!(
            parse_net("44.0.0.0/8").unwrap(),
            (Ipv4Addr::new(44, 0, 0, 0), 8)
        );
    }

    #[test]
    fn rejects_missing_slash() {
        assert!(parse_net("44.0.0.0").is_err());
    }

    #[test]
    fn rejects_oversized_prefix() {
        assert!(parse_net("44.0.0.0/33").is_err());
    }

    #[test]
    fn accept_before_ignore_on_the_command_line_makes_accept_win() {
        let matches = Cli::command()
            .try_get_matches_from([
                "ampr-ripd",
                "-A",
                "44.0.0.0/8",
                "-I",
                "44.0.0.0/8",
                "--password",
                "x",
                "198.51.100.1",
                "44.0.0.1",
            ])
            .unwrap();
        let cli = Cli::from_matches_ordered(matches);
        let config = cli.into_config().unwrap();

        assert_eq!(
            config.acceptance.effective(Ipv4Addr::new(44, 0, 0, 0), 8),
            Policy::Accept
        );
    }

    #[test]
    fn ignore_before_accept_on_the_command_line_makes_ignore_win() {
        let matches = Cli::command()
            .try_get_matches_from([
                "ampr-ripd",
                "-I",
                "44.0.0.0/8",
                "-A",
                "44.0.0.0/8",
                "--password",
                "x",
                "198.51.100.1",
                "44.0.0.1",
            ])
            .unwrap();
        let cli = Cli::from_matches_ordered(matches);
        let config = cli.into_config().unwrap();

        assert_eq!(
            config.acceptance.effective(Ipv4Addr::new(44, 0, 0, 0), 8),
            Policy::Ignore
        );
    }
}
