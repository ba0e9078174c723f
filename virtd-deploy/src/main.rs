//! # virtd
//!
//! Provisions the libvirt machines and virtual networks of a deployment.
//!
//! ## Usage
//! ```bash
//! virtd --deployment lab.yaml deploy --allow-reboot
//! virtd --deployment lab.yaml info
//! virtd --deployment lab.yaml destroy --yes
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use virtd_hypervisor::{
    AutoConfirm, Confirm, DeploymentInfo, HypervisorConnector, IpDiscovery, MockConnector,
    QemuImg, StateStore, Toolbox,
};

use virtd_deploy::cli::{Args, Command};
use virtd_deploy::dev::DevEnvironment;
use virtd_deploy::{
    DeployOptions, Deployment, Driver, JsonFileStore, NixBuilder, PromptConfirm, Settings,
    SshKeygen,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match Settings::resolve(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("virtd: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = virtd_common::init_logging(&settings.log_level, settings.log_format) {
        eprintln!("virtd: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args, settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!(error = %format!("{:#}", e), "virtd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, settings: Settings) -> Result<bool> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting virtd");

    let deployment = Deployment::load(&args.deployment)
        .with_context(|| format!("Failed to load {}", args.deployment.display()))?
        .with_default_uri(&settings.default_uri);

    let store = Arc::new(
        JsonFileStore::open(&settings.state_file)
            .with_context(|| format!("Failed to open {}", settings.state_file.display()))?,
    );
    let uuid = match &deployment.uuid {
        Some(uuid) => uuid.clone(),
        None => store.ensure_uuid(|| uuid::Uuid::new_v4().to_string())?,
    };
    let identity = DeploymentInfo::new(uuid, deployment.name.clone());

    // Keeps the mock image directory alive for the whole run.
    let mut dev_env = None;
    let (connector, toolbox): (Arc<dyn HypervisorConnector>, Toolbox) = if args.mock {
        warn!("Using the in-memory mock hypervisor; nothing is provisioned");
        let env = DevEnvironment::new(&deployment, &identity)?;
        let parts = (
            Arc::new(MockConnector::new(env.backend.clone())) as Arc<dyn HypervisorConnector>,
            env.toolbox.clone(),
        );
        dev_env = Some(env);
        parts
    } else {
        (real_connector()?, real_toolbox(&settings, &deployment)?)
    };

    let driver = Driver::new(
        deployment,
        identity,
        store.clone() as Arc<dyn StateStore>,
        connector,
        toolbox,
    )
    .with_discovery(IpDiscovery::new(settings.poll_interval()));

    let outcome = dispatch(&driver, args.command).await;
    drop(dev_env);
    outcome
}

async fn dispatch(driver: &Driver, command: Command) -> Result<bool> {
    match command {
        Command::Deploy {
            allow_reboot,
            allow_recreate,
            check,
        } => {
            driver
                .deploy(DeployOptions {
                    allow_reboot,
                    allow_recreate,
                    check,
                })
                .await?;
            Ok(true)
        }
        Command::Destroy { yes, wipe } => {
            let confirm: Box<dyn Confirm> = if yes {
                Box::new(AutoConfirm(true))
            } else {
                Box::new(PromptConfirm::stdin())
            };
            driver.destroy(confirm.as_ref(), wipe).await
        }
        Command::Check => {
            for status in driver.check().await? {
                println!("{}", status);
            }
            Ok(true)
        }
        Command::Info => {
            for status in driver.info()? {
                println!("{}", status);
            }
            Ok(true)
        }
        Command::Console { machine } => {
            let command = driver.console_command(&machine)?;
            let (program, rest) = command
                .split_first()
                .context("Empty console command")?;
            let status = tokio::process::Command::new(program)
                .args(rest)
                .status()
                .await
                .with_context(|| format!("Failed to run {}", program))?;
            Ok(status.success())
        }
        Command::SshArgs { machine } => {
            let key_dir = std::env::temp_dir().join(format!("virtd-{}", driver.identity().id));
            std::fs::create_dir_all(&key_dir)
                .with_context(|| format!("Failed to create {}", key_dir.display()))?;
            let target = driver.ssh_target(&machine, &key_dir).await?;
            println!("{} {}", target.flags.join(" "), target.address);
            Ok(true)
        }
    }
}

#[cfg(feature = "libvirt")]
fn real_connector() -> Result<Arc<dyn HypervisorConnector>> {
    Ok(Arc::new(virtd_hypervisor::LibvirtConnector))
}

#[cfg(not(feature = "libvirt"))]
fn real_connector() -> Result<Arc<dyn HypervisorConnector>> {
    anyhow::bail!("virtd was built without libvirt support; rebuild with --features libvirt or pass --mock")
}

fn real_toolbox(settings: &Settings, deployment: &Deployment) -> Result<Toolbox> {
    let builder = NixBuilder::new(settings.evaluator.clone(), deployment.network_exprs.clone())?;
    Ok(Toolbox::new(
        Arc::new(builder),
        Arc::new(QemuImg::new().with_binary(settings.evaluator.qemu_img.clone())),
        Arc::new(SshKeygen::new(settings.evaluator.ssh_keygen.clone())),
    ))
}
