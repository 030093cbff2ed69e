use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use cvmstep_api::{CvmApiClient, InstanceProvisioner};
use cvmstep_engine::{
    BootstrapComposer, BuiltinDefaults, DispatchContext, DispatchSettings, EnvSnapshot, RemoteStepAdapter, StepOptions,
    config::parse_env_pair, content_hash, resolve_spec,
};
use cvmstep_storage::{SYSROOT_ENV, StorageLocation, open_store, package_key, sentinel_key};
use cvmstep_types::{InstanceHandle, InstanceSpec, RunArtifact, StepDescriptor};
use cvmstep_util::redact_env_value;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cvmstep", version, about = "Run workflow steps on ephemeral confidential VMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch one step to a fresh instance and exit with its exit code.
    Step(StepArgs),
    /// Print the bootstrap payload for a step without provisioning anything.
    Compose(StepArgs),
    /// Show the lifecycle status of an instance.
    Status { id: String },
    /// Destroy an instance, e.g. one leaked by an interrupted dispatch.
    Destroy { id: String },
}

#[derive(Debug, Args)]
struct StepArgs {
    #[arg(long)]
    flow: String,
    #[arg(long)]
    step: String,
    #[arg(long = "run-id")]
    run_id: String,
    #[arg(long = "task-id")]
    task_id: String,
    #[arg(long, default_value_t = 0)]
    attempt: u32,
    /// Shell command run before the step; repeatable, aborts the step on failure.
    #[arg(long = "setup")]
    setup: Vec<String>,
    /// The step command itself.
    #[arg(long)]
    command: String,
    /// Path to the run's code package (tar.gz).
    #[arg(long)]
    package: PathBuf,
    #[arg(long, env = SYSROOT_ENV)]
    sysroot: String,
    /// Accept a local directory as the datastore. Remote instances cannot reach it.
    #[arg(long)]
    allow_local_datastore: bool,
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    cpu: Option<u32>,
    /// Memory in MB.
    #[arg(long)]
    memory: Option<u32>,
    /// Disk in GB.
    #[arg(long)]
    disk: Option<u32>,
    /// Timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Extra environment entry as KEY=VALUE; repeatable.
    #[arg(long = "env")]
    env: Vec<String>,
}

impl StepArgs {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            flow_name: self.flow.clone(),
            step_name: self.step.clone(),
            run_id: self.run_id.clone(),
            task_id: self.task_id.clone(),
            attempt: self.attempt,
            setup_commands: self.setup.clone(),
            command: self.command.clone(),
        }
    }

    fn options(&self) -> Result<StepOptions> {
        let mut env = IndexMap::new();
        for entry in &self.env {
            let (key, value) = parse_env_pair("--env", entry)?;
            env.insert(key, value);
        }
        Ok(StepOptions {
            image: self.image.clone(),
            cpu: self.cpu,
            memory_mb: self.memory,
            disk_gb: self.disk,
            timeout_s: self.timeout,
            env,
        })
    }

    fn location(&self) -> Result<StorageLocation> {
        let location = StorageLocation::parse(&self.sysroot).context("invalid datastore sysroot")?;
        if matches!(location, StorageLocation::Local { .. }) && !self.allow_local_datastore {
            bail!(
                "datastore '{}' is a local directory that remote instances cannot reach; \
                 use an s3:// or https:// sysroot, or pass --allow-local-datastore",
                self.sysroot
            );
        }
        Ok(location)
    }

    fn resolve(&self, env: &EnvSnapshot) -> Result<InstanceSpec> {
        Ok(resolve_spec(&self.options()?, env, &BuiltinDefaults::default())?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Step(args) => {
            let code = run_step(&args).await?;
            std::process::exit(code);
        }
        Command::Compose(args) => print_payload(&args).await,
        Command::Status { id } => {
            let client = CvmApiClient::from_env()?;
            let status = client.status(&InstanceHandle::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Destroy { id } => {
            let client = CvmApiClient::from_env()?;
            let handle = InstanceHandle::new(id);
            client.destroy(&handle).await?;
            info!(instance_id = %handle, "instance destroyed");
            Ok(())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` directives, defaulting to `info`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn run_step(args: &StepArgs) -> Result<i32> {
    let env = EnvSnapshot::capture();
    let spec = args.resolve(&env)?;
    let settings = DispatchSettings::from_env(&env)?;
    let store = open_store(&args.location()?)?;
    let provisioner: Arc<dyn InstanceProvisioner> = Arc::new(CvmApiClient::from_env()?);
    let package = tokio::fs::read(&args.package)
        .await
        .with_context(|| format!("failed to read code package {}", args.package.display()))?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let mut adapter = RemoteStepAdapter::new(
        DispatchContext::new(store, provisioner, settings),
        args.descriptor(),
        Arc::new(package),
    )
    .with_cancellation(cancel);
    adapter.prepare(spec);

    let outcome = adapter.run().await;
    info!(outcome = ?outcome, "step finished");
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(outcome.process_exit_code())
}

async fn print_payload(args: &StepArgs) -> Result<()> {
    let env = EnvSnapshot::capture();
    let spec = args.resolve(&env)?;
    let store = open_store(&args.location()?)?;
    let step = args.descriptor();
    let package = tokio::fs::read(&args.package)
        .await
        .with_context(|| format!("failed to read code package {}", args.package.display()))?;

    let artifact = RunArtifact {
        run_id: step.run_id.clone(),
        storage_key: package_key(&step.run_id)?,
        content_hash: content_hash(&package),
    };
    let sentinel = sentinel_key(&step.run_id, &step.invocation_id())?;
    let payload = BootstrapComposer::new(store).compose(&spec, &artifact, &sentinel, &step)?;

    let environment: serde_json::Map<String, serde_json::Value> = payload
        .environment
        .iter()
        .map(|(key, value)| (key.clone(), serde_json::Value::String(redact_env_value(key, value))))
        .collect();
    let out = serde_json::json!({
        "instance_name": payload.instance_name,
        "image": payload.image,
        "resources": payload.resources,
        "environment": environment,
        "sentinel_key": sentinel,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("shutdown signal received; cancelling dispatch and cleaning up");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
