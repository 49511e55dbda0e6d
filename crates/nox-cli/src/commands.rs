//! Command handlers.

use crate::cli::{
    AutostartArgs, Cli, Command, ConfigCmd, CreateArgs, ImagesArgs, ResizeArgs, RestoreArgs,
    RunArgs, SshArgs,
};
use crate::output;
use anyhow::{bail, Context, Result};
use nox_core::{
    ConfigStore, CoreError, CreateRequest, InstanceRecord, InstanceState, NoxManager, Paths,
    ResizeRequest, RestoreRequest,
};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as Process;

/// Options passed to every ssh/scp invocation. Guest host keys change on
/// every create and restore, so they are not pinned.
const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=10",
];

/// Where `nox run` places the script inside the guest.
const REMOTE_SCRIPT: &str = "/tmp/nox-run.sh";

pub async fn run(cli: Cli) -> Result<()> {
    let paths = Paths::from_env()?;

    // Config edits work without libvirt or a valid remote.
    if let Command::Config(cmd) = cli.command {
        return config(&paths, cmd);
    }

    let store = ConfigStore::load(paths.config_file())
        .with_context(|| format!("loading {}", paths.config_file().display()))?;
    let nox = NoxManager::open(paths, store.config().clone())?;
    dispatch(&nox, cli.command).await
}

async fn dispatch(nox: &NoxManager, command: Command) -> Result<()> {
    match command {
        Command::Create(args) => create(nox, args).await,
        Command::Start(args) => {
            let record = nox.orchestrator().start(&args.name).await?;
            println!("Instance '{}' is {}", record.name, record.state);
            Ok(())
        }
        Command::Stop(args) => {
            let record = nox.orchestrator().stop(&args.name).await?;
            println!("Instance '{}' is {}", record.name, record.state);
            Ok(())
        }
        Command::Restart(args) => {
            let record = nox.orchestrator().restart(&args.name).await?;
            println!("Instance '{}' restarted", record.name);
            Ok(())
        }
        Command::Delete(args) => {
            nox.orchestrator().delete(&args.name).await?;
            println!("Instance '{}' deleted", args.name);
            Ok(())
        }
        Command::List => list(nox).await,
        Command::Status(args) => status(nox, &args.name).await,
        Command::Resize(args) => resize(nox, args).await,
        Command::Autostart(args) => autostart(nox, args).await,
        Command::Ip(args) => {
            let ip = nox.locator().refresh(&args.name).await?;
            match ip {
                Some(ip) => println!("{ip}"),
                None => println!("{}", output::UNKNOWN),
            }
            Ok(())
        }
        Command::Ssh(args) => ssh(nox, args).await,
        Command::Run(args) => run_script(nox, args).await,
        Command::Images(args) => images(nox, args).await,
        Command::Backup(args) => {
            let outcome = nox.backups().backup(&args.name).await?;
            println!(
                "Backup {} written to {} ({})",
                outcome.backup.id(),
                outcome.backup.location,
                output::human_size(outcome.backup.size)
            );
            if let Some(warning) = outcome.warning {
                eprintln!("Warning: {warning}");
            }
            Ok(())
        }
        Command::Backups => {
            let backups = nox.backups().backups().await?;
            print!("{}", output::backup_table(&backups));
            Ok(())
        }
        Command::Restore(args) => restore(nox, args).await,
        Command::Config(cmd) => config(nox.paths(), cmd),
    }
}

async fn create(nox: &NoxManager, args: CreateArgs) -> Result<()> {
    let name = args.name.clone();
    let request = CreateRequest {
        os: args.os,
        cpus: args.cpus,
        ram: args.ram,
        disk: args.disk,
        scripts: args.script,
        static_ip: args.ip,
        autostart: !args.no_autostart,
        start: !args.no_start,
        ..CreateRequest::new(args.name)
    };
    let start = request.start;

    eprintln!("Creating instance '{name}'...");
    let (record, password) = tokio::select! {
        result = nox.orchestrator().create(request) => result?,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the create future starts cleanup; let spawned
            // teardown reach libvirt before the process exits.
            tokio::time::sleep(Duration::from_millis(500)).await;
            bail!("interrupted; remove what is left with `nox delete {name}`");
        }
    };

    let ip = if start {
        eprintln!("Waiting for an address...");
        wait_and_record(nox, &record).await?
    } else {
        None
    };

    print!("{}", output::credentials(&record.name, &password, ip, start));
    Ok(())
}

/// Wait for the guest address and store it. A timeout is not an error here;
/// the instance is up, the address just is not visible yet.
async fn wait_and_record(nox: &NoxManager, record: &InstanceRecord) -> Result<Option<Ipv4Addr>> {
    match nox.locator().wait_for_address(record).await {
        Ok(ip) => {
            nox.orchestrator()
                .registry()
                .set_last_ip(&record.name, Some(ip))
                .await?;
            Ok(Some(ip))
        }
        Err(CoreError::NetworkTimeout { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list(nox: &NoxManager) -> Result<()> {
    let mut records = nox.orchestrator().list().await?;
    for record in records.iter_mut() {
        if record.state == InstanceState::Running {
            record.last_ip = nox.locator().locate(record).await;
        } else {
            record.last_ip = None;
        }
    }
    print!("{}", output::instance_table(&records));
    Ok(())
}

async fn status(nox: &NoxManager, name: &str) -> Result<()> {
    let mut record = nox.orchestrator().status(name).await?;
    record.last_ip = if record.state == InstanceState::Running {
        nox.locator().refresh(name).await?
    } else {
        None
    };
    print!("{}", output::instance_status(&record));
    Ok(())
}

async fn resize(nox: &NoxManager, args: ResizeArgs) -> Result<()> {
    let request = ResizeRequest {
        cpus: args.cpus,
        ram: args.ram,
        disk: args.disk,
    };
    let record = nox.orchestrator().resize(&args.name, &request).await?;
    println!(
        "Instance '{}' now has {} vCPUs, {} MB RAM, {} GB disk",
        record.name, record.vcpus, record.ram_mb, record.disk_gb
    );
    if args.disk.is_some() && record.state == InstanceState::Running {
        println!("Grow the guest filesystem to use the new space (cloud images do this on reboot)");
    }
    Ok(())
}

async fn autostart(nox: &NoxManager, args: AutostartArgs) -> Result<()> {
    let record = nox
        .orchestrator()
        .set_autostart(&args.name, args.enable)
        .await?;
    println!(
        "Autostart {} for '{}'",
        if record.autostart { "enabled" } else { "disabled" },
        record.name
    );
    Ok(())
}

/// Address of a running instance, starting it first when `boot` is set.
async fn reachable(nox: &NoxManager, name: &str, boot: bool) -> Result<Ipv4Addr> {
    let mut record = nox.orchestrator().status(name).await?;
    if record.state != InstanceState::Running {
        if !boot {
            bail!("instance '{name}' is not running (state: {})", record.state);
        }
        eprintln!("Starting '{name}'...");
        record = nox.orchestrator().start(name).await?;
    }

    match wait_and_record(nox, &record).await? {
        Some(ip) => Ok(ip),
        None => bail!("could not determine the address of '{name}'"),
    }
}

async fn ssh(nox: &NoxManager, args: SshArgs) -> Result<()> {
    let ip = reachable(nox, &args.name, true).await?;
    let key = nox.orchestrator().host_key().private_path();

    let status = Process::new("ssh")
        .arg("-i")
        .arg(key)
        .args(SSH_OPTIONS)
        .arg(format!("nox@{ip}"))
        .args(&args.command)
        .status()
        .await
        .context("running ssh")?;
    exit_with(status)
}

async fn run_script(nox: &NoxManager, args: RunArgs) -> Result<()> {
    if !args.script.is_file() {
        bail!("script not found: {}", args.script.display());
    }
    let ip = reachable(nox, &args.name, false).await?;
    let key = nox.orchestrator().host_key().private_path();

    let copied = scp(key, &args.script, ip).await?;
    if !copied.success() {
        bail!("copying {} to '{}' failed", args.script.display(), args.name);
    }

    let status = Process::new("ssh")
        .arg("-i")
        .arg(key)
        .args(SSH_OPTIONS)
        .arg(format!("nox@{ip}"))
        .arg(format!("chmod +x {REMOTE_SCRIPT} && {REMOTE_SCRIPT}"))
        .status()
        .await
        .context("running ssh")?;
    exit_with(status)
}

async fn scp(key: &Path, script: &Path, ip: Ipv4Addr) -> Result<std::process::ExitStatus> {
    Process::new("scp")
        .arg("-i")
        .arg(key)
        .args(SSH_OPTIONS)
        .arg(script)
        .arg(format!("nox@{ip}:{REMOTE_SCRIPT}"))
        .status()
        .await
        .context("running scp")
}

/// Propagate the exit code of ssh or the remote command.
fn exit_with(status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    std::process::exit(status.code().unwrap_or(1));
}

async fn images(nox: &NoxManager, args: ImagesArgs) -> Result<()> {
    if args.prune {
        let removed = nox.images().prune().await?;
        if removed.is_empty() {
            println!("Nothing to prune");
        }
        for image in removed {
            println!(
                "Removed {}-{} ({})",
                image.os,
                image.arch,
                output::human_size(image.size)
            );
        }
        return Ok(());
    }

    print!("{}", output::image_table(&nox.images().list().await?));
    println!();
    println!("Available:");
    for (os, entry) in nox.images().catalog().entries() {
        if entry.description.is_empty() {
            println!("  {os}");
        } else {
            println!("  {os:<16} {}", entry.description);
        }
    }
    Ok(())
}

async fn restore(nox: &NoxManager, args: RestoreArgs) -> Result<()> {
    let reference = match args.archive {
        Some(reference) => reference,
        None => choose_backup(nox).await?,
    };

    let request = RestoreRequest {
        reference,
        name: args.name,
        force: args.force,
        start: !args.no_start,
    };
    let start = request.start;
    let outcome = nox.backups().restore(request).await?;
    let record = outcome.record;

    match outcome.password {
        Some(password) => {
            let ip = if start {
                wait_and_record(nox, &record).await?
            } else {
                None
            };
            print!("{}", output::credentials(&record.name, &password, ip, start));
        }
        None => println!("Instance '{}' restored ({})", record.name, record.state),
    }
    Ok(())
}

/// Interactive pick, newest first. An empty answer takes the newest.
async fn choose_backup(nox: &NoxManager) -> Result<String> {
    let backups = nox.backups().backups().await?;
    if backups.is_empty() {
        bail!("no backups found");
    }

    eprint!("{}", output::backup_table(&backups));
    eprint!("Restore which backup? [1]: ");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading choice")?;
    let index = pick(line.trim(), backups.len())?;
    Ok(backups[index].id())
}

/// Zero-based index for a 1-based answer.
fn pick(answer: &str, count: usize) -> Result<usize> {
    if answer.is_empty() {
        return Ok(0);
    }
    match answer.parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Ok(n - 1),
        _ => bail!("invalid choice {answer:?}; expected 1-{count}"),
    }
}

fn config(paths: &Paths, cmd: ConfigCmd) -> Result<()> {
    let mut store = ConfigStore::load(paths.config_file())?;
    match cmd {
        ConfigCmd::Get { key } => {
            let Some(value) = store.get(key.as_deref())? else {
                bail!("unknown config key: {}", key.unwrap_or_default());
            };
            match value {
                serde_json::Value::String(s) => println!("{s}"),
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    println!("{}", serde_json::to_string_pretty(&value)?)
                }
                other => println!("{other}"),
            }
        }
        ConfigCmd::Set { key, value } => {
            store.set(&key, &value)?;
            println!("Set {key} = {value}");
        }
    }
    Ok(())
}
