use clap::{Args, Parser, Subcommand};
use dmirror_rpc::ResourceKind;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dmirror", version, about)]
pub struct Cli {
    /// Config file (default: dmirror.toml in the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the mirroring service in the foreground
    Serve,
    /// Start mirroring a log or drive
    Mirror(Target),
    /// Stop mirroring a log or drive
    Unmirror(Target),
    /// Show whether a log or drive is being mirrored
    Status(Target),
    /// List everything the service has been asked to mirror
    List,
    /// Shut the running service down
    Stop,
}

#[derive(Debug, Args)]
pub struct Target {
    /// 64-character hex key
    pub key: String,
    /// Resource type: base (ddatabase) or drive (ddrive)
    #[arg(short = 't', long = "type", value_parser = parse_kind)]
    pub kind: Option<ResourceKind>,
}

fn parse_kind(value: &str) -> Result<ResourceKind, String> {
    value.parse().map_err(|e: dmirror_rpc::error::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[rstest]
    #[case(&["dmirror", "mirror", KEY], None)]
    #[case(&["dmirror", "mirror", KEY, "--type", "drive"], Some(ResourceKind::Drive))]
    #[case(&["dmirror", "mirror", KEY, "-t", "ddatabase"], Some(ResourceKind::Base))]
    fn test_mirror_args(#[case] args: &[&str], #[case] kind: Option<ResourceKind>) {
        let cli = Cli::try_parse_from(args).unwrap();
        let Command::Mirror(target) = cli.command else {
            panic!("expected mirror, got {:?}", cli.command);
        };
        assert_eq!(target.key, KEY);
        assert_eq!(target.kind, kind);
    }

    #[test]
    fn test_unknown_type() {
        assert!(Cli::try_parse_from(["dmirror", "status", KEY, "--type", "folder"]).is_err());
    }

    #[test]
    fn test_global_config() {
        let cli = Cli::try_parse_from(["dmirror", "list", "--config", "/etc/dmirror.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dmirror.toml")));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
