//! Command-line definitions.

use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

/// nox - virtual machines on one host, backed by libvirt and QEMU
#[derive(Parser, Debug)]
#[command(name = "nox")]
#[command(about = "Create, run, back up and restore VMs on a single host")]
#[command(
    long_about = "nox manages KVM virtual machines on one host through libvirt.\n\n\
Resources accept a fraction of the host (0.5 = half) or an absolute amount \
(cpus, MB of RAM, GB of disk).\n\n\
Quick start:\n  \
nox create web --cpus 0.5 --ram 2048 --disk 20\n  \
nox ssh web\n  \
nox backup web"
)]
#[command(version)]
pub struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new instance and show its SSH credentials
    Create(CreateArgs),

    /// Start an instance
    Start(NameArg),

    /// Shut an instance down (forced after the stop timeout)
    Stop(NameArg),

    /// Stop then start an instance
    Restart(NameArg),

    /// Delete an instance and its disk
    #[command(alias = "rm")]
    Delete(NameArg),

    /// List instances
    #[command(visible_alias = "ls")]
    List,

    /// Show instance details
    Status(NameArg),

    /// Change cpus or ram (stopped) or grow the disk
    Resize(ResizeArgs),

    /// Enable or disable start on host boot
    Autostart(AutostartArgs),

    /// Print an instance's IPv4 address
    Ip(NameArg),

    /// Open an SSH session, or run a command over SSH
    Ssh(SshArgs),

    /// Copy a script to a running instance and execute it
    Run(RunArgs),

    /// List cached base images and the catalog
    Images(ImagesArgs),

    /// Back up an instance
    Backup(NameArg),

    /// List local and remote backups
    Backups,

    /// Restore an instance from a backup
    Restore(RestoreArgs),

    /// Read or change configuration
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args, Debug)]
pub struct NameArg {
    /// Instance name
    pub name: String,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Instance name (also the guest hostname)
    pub name: String,

    /// Operating system image (see `nox images`)
    #[arg(long)]
    pub os: Option<String>,

    /// vCPUs: fraction of host cores (≤ 1.0) or a count
    #[arg(long)]
    pub cpus: Option<f64>,

    /// Memory: fraction of host RAM (≤ 1.0) or MB
    #[arg(long)]
    pub ram: Option<f64>,

    /// Disk: fraction of total disk (≤ 1.0) or GB
    #[arg(long)]
    pub disk: Option<f64>,

    /// Launch scripts, comma-separated names from the scripts directory or paths
    #[arg(long, value_delimiter = ',')]
    pub script: Vec<String>,

    /// Static address in CIDR notation (default: DHCP)
    #[arg(long, value_name = "CIDR")]
    pub ip: Option<String>,

    /// Do not start the instance when the host boots
    #[arg(long)]
    pub no_autostart: bool,

    /// Create without starting
    #[arg(long)]
    pub no_start: bool,
}

#[derive(Args, Debug)]
pub struct ResizeArgs {
    /// Instance name
    pub name: String,

    /// New vCPU count or host fraction (instance must be stopped)
    #[arg(long)]
    pub cpus: Option<f64>,

    /// New memory in MB or host fraction (instance must be stopped)
    #[arg(long)]
    pub ram: Option<f64>,

    /// New disk size in GB or fraction; can only grow
    #[arg(long)]
    pub disk: Option<f64>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("mode").required(true).args(["enable", "disable"])))]
pub struct AutostartArgs {
    /// Instance name
    pub name: String,

    #[arg(long)]
    pub enable: bool,

    #[arg(long)]
    pub disable: bool,
}

#[derive(Args, Debug)]
pub struct SshArgs {
    /// Instance name
    pub name: String,

    /// Command to run instead of a login shell
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Instance name
    pub name: String,

    /// Script on the host
    pub script: PathBuf,
}

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Remove cached images no instance uses
    #[arg(long)]
    pub prune: bool,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Archive path, backup id or remote key (prompts when omitted)
    pub archive: Option<String>,

    /// Restore under a different name
    #[arg(long)]
    pub name: Option<String>,

    /// Replace an existing instance with the same name
    #[arg(long)]
    pub force: bool,

    /// Leave the restored instance stopped
    #[arg(long)]
    pub no_start: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Print a value (dotted key) or the whole configuration
    Get {
        key: Option<String>,
    },

    /// Set a value by dotted key, e.g. `defaults.ram 1024`
    Set {
        key: String,
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_disk_help_names_total_capacity() {
        let cmd = Cli::command();
        let create = cmd.find_subcommand("create").unwrap();
        let disk = create.get_arguments().find(|a| a.get_id() == "disk").unwrap();
        let help = disk.get_help().unwrap().to_string();
        assert!(help.contains("total disk"), "{help}");
        assert!(!help.contains("free"), "{help}");
    }

    #[test]
    fn test_create_args() {
        let cli = Cli::parse_from([
            "nox", "create", "web", "--cpus", "0.5", "--ram", "2048", "--script", "docker,tailscale",
            "--no-start",
        ]);
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.name, "web");
        assert_eq!(args.cpus, Some(0.5));
        assert_eq!(args.ram, Some(2048.0));
        assert_eq!(args.script, vec!["docker", "tailscale"]);
        assert!(args.no_start);
        assert!(!args.no_autostart);
    }

    #[test]
    fn test_ls_alias_and_ssh_trailing() {
        assert!(matches!(
            Cli::parse_from(["nox", "ls"]).command,
            Command::List
        ));

        let cli = Cli::parse_from(["nox", "ssh", "web", "uname", "-a"]);
        let Command::Ssh(args) = cli.command else {
            panic!("expected ssh");
        };
        assert_eq!(args.command, vec!["uname", "-a"]);
    }

    #[test]
    fn test_autostart_requires_mode() {
        assert!(Cli::try_parse_from(["nox", "autostart", "web"]).is_err());
        assert!(Cli::try_parse_from(["nox", "autostart", "web", "--enable", "--disable"]).is_err());
        assert!(Cli::try_parse_from(["nox", "autostart", "web", "--disable"]).is_ok());
    }

    #[test]
    fn test_usage_error_exit_code() {
        let err = Cli::try_parse_from(["nox", "create"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
