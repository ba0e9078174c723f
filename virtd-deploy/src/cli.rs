//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// virtd - provision libvirt machines and virtual networks
#[derive(Parser, Debug)]
#[command(name = "virtd")]
#[command(about = "virtd - provision libvirt machines and virtual networks")]
#[command(version)]
pub struct Args {
    /// Deployment definition (YAML)
    #[arg(short, long, global = true, env = "VIRTD_DEPLOYMENT", default_value = "deployment.yaml")]
    pub deployment: PathBuf,

    /// State file (overrides the settings file)
    #[arg(short, long, global = true)]
    pub state: Option<PathBuf>,

    /// Settings file (optional, defaults used if not found)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Use the in-memory mock hypervisor (no libvirt needed)
    #[arg(long, global = true)]
    pub mock: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create or update all networks, then all machines
    Deploy {
        /// Allow changes that need a machine or network restart
        #[arg(long)]
        allow_reboot: bool,

        /// Allow redefining machines whose domain disappeared
        #[arg(long)]
        allow_recreate: bool,

        /// Compare recorded state with the hypervisor first
        #[arg(long)]
        check: bool,
    },

    /// Destroy all machines, then all networks
    Destroy {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Also forget keys, MAC address and storage pool
        #[arg(long)]
        wipe: bool,
    },

    /// Compare recorded state with the hypervisor
    Check,

    /// List resources with their type, state and address
    Info,

    /// Attach to the serial console of a machine
    Console {
        machine: String,
    },

    /// Print the address and SSH options of a machine
    SshArgs {
        machine: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_flags() {
        let args = Args::try_parse_from([
            "virtd",
            "--deployment",
            "net.yaml",
            "deploy",
            "--allow-reboot",
            "--check",
        ])
        .unwrap();

        assert_eq!(args.deployment, PathBuf::from("net.yaml"));
        assert_eq!(
            args.command,
            Command::Deploy {
                allow_reboot: true,
                allow_recreate: false,
                check: true,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["virtd", "destroy", "--yes", "--mock", "--json-logs"]).unwrap();
        assert!(args.mock);
        assert!(args.json_logs);
        assert_eq!(args.command, Command::Destroy { yes: true, wipe: false });
    }

    #[test]
    fn test_machine_argument_required() {
        assert!(Args::try_parse_from(["virtd", "console"]).is_err());
        let args = Args::try_parse_from(["virtd", "ssh-args", "web"]).unwrap();
        assert_eq!(args.command, Command::SshArgs { machine: "web".into() });
    }
}
