// src/main.rs
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use futures::TryStreamExt;
use tracing::{error, info, warn};

use kube_access::{
    cert::{
        verify_certificate, CaKeyMaterial, CertificateAuthoritySigner, CertificateStatus,
        IssuanceLedger, KeyMaterialGenerator,
    },
    config::AccessConfig,
    kubeconfig::{AccessBundle, BundleRegistry, CredentialBundleWriter},
    rbac::{ClusterApi, InMemoryClusterApi, KubeClusterApi, RbacReconciler, RoleDefinition, RoleScope},
    utils::logging,
    AccessError, AccessLifecycleOrchestrator, Identity,
};

type CliResult<T> = std::result::Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "kube-access", version, about = "Kubernetes user credential lifecycle")]
pub struct Cli {
    /// Configuration file (default: <config dir>/kube-access/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    pub debug: bool,
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    /// Keep ledger, registry and cluster state in memory; nothing is written
    #[arg(long, global = true)]
    pub dry_run: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a default configuration file
    InitConfig {
        #[arg(long)]
        force: bool,
    },
    /// Generate a self-signed cluster CA at the configured paths
    InitCa {
        #[arg(long, default_value = "kubernetes-ca")]
        common_name: String,
        #[arg(long, default_value_t = 3650)]
        days: u32,
        #[arg(long)]
        force: bool,
    },
    /// Issue a certificate, write a kubeconfig bundle and bind a role
    Onboard {
        user: String,
        /// Group (certificate O attribute); repeatable
        #[arg(short, long = "group")]
        groups: Vec<String>,
        #[command(flatten)]
        role: RoleArgs,
        /// Certificate validity in days (default from configuration)
        #[arg(long)]
        days: Option<u32>,
        /// Bundle path (default: <output dir>/<user>@<cluster>.kubeconfig)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a role binding and optionally revoke the user's certificates
    Offboard {
        user: String,
        #[command(flatten)]
        role: RoleArgs,
        #[arg(long)]
        revoke: bool,
    },
    /// List the roles bound to a user
    Bindings { user: String },
    /// Check a certificate or kubeconfig bundle against the CA and ledger
    Verify { path: PathBuf },
    /// Render the CRL to the configured path, or stdout
    Crl,
}

#[derive(Args)]
pub struct RoleArgs {
    /// Role definition YAML; the role is created if missing
    #[arg(long, conflicts_with_all = ["role", "namespace", "cluster_wide"])]
    pub role_file: Option<PathBuf>,
    /// Name of an existing Role or ClusterRole
    #[arg(long)]
    pub role: Option<String>,
    #[arg(short, long, conflicts_with = "cluster_wide")]
    pub namespace: Option<String>,
    #[arg(long)]
    pub cluster_wide: bool,
}

impl RoleArgs {
    fn resolve(&self) -> kube_access::Result<RoleDefinition> {
        if let Some(path) = &self.role_file {
            return RoleDefinition::load(path);
        }
        let Some(name) = &self.role else {
            return Err(AccessError::validation("either --role-file or --role is required"));
        };
        let scope = match (&self.namespace, self.cluster_wide) {
            (Some(ns), false) => RoleScope::Namespace(ns.clone()),
            (None, true) => RoleScope::Cluster,
            _ => {
                return Err(AccessError::validation(
                    "--role needs exactly one of --namespace or --cluster-wide",
                ))
            }
        };
        let role = RoleDefinition::existing(name.clone(), scope);
        role.validate()?;
        Ok(role)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.debug, cli.log_file.as_deref()) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(AccessConfig::default_path);
    let load = || load_config(&config_path);

    match cli.command {
        Command::InitConfig { force } => init_config(&config_path, force)?,
        Command::InitCa {
            common_name,
            days,
            force,
        } => init_ca(&load()?, &common_name, days, force, cli.dry_run)?,
        Command::Onboard {
            user,
            groups,
            role,
            days,
            output,
        } => {
            let identity = Identity::new(user, groups)?;
            let config = load()?;
            let role = role.resolve()?;
            let ca = load_ca(&config)?;
            let orchestrator = build_orchestrator(&config, cli.dry_run).await?;
            let cluster = config.endpoint(Some(ca.cert_pem().to_string()));
            let days = days.unwrap_or(config.default_validity_days);

            let outcome = orchestrator
                .onboard(&identity, &role, &cluster, &ca, days)
                .await?;

            if cli.dry_run {
                info!("Dry run: bundle not written");
            } else {
                let path = output.unwrap_or_else(|| {
                    config.output_dir().join(format!(
                        "{}.kubeconfig",
                        CredentialBundleWriter::context_name(&identity, &cluster)
                    ))
                });
                outcome.bundle.write_to(&path)?;
                println!("Wrote {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Offboard { user, role, revoke } => {
            let identity = Identity::new(user, vec![])?;
            let config = load()?;
            let role = role.resolve()?;
            let ca = load_ca(&config)?;
            let orchestrator = build_orchestrator(&config, cli.dry_run).await?;

            let outcome = orchestrator.offboard(&identity, &role, &ca, revoke).await?;

            if let Some(replacement) = &outcome.rotated_ca {
                if cli.dry_run {
                    info!("Dry run: replacement CA not written");
                } else {
                    let cert_path = with_suffix(&config.ca_cert_path(), "next");
                    let key_path = with_suffix(&config.ca_key_path(), "next");
                    replacement.save(&cert_path, &key_path)?;
                    warn!(
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "Replacement CA written; install it as the cluster client CA and reissue remaining users"
                    );
                }
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Bindings { user } => {
            let identity = Identity::new(user, vec![])?;
            let config = load()?;
            let orchestrator = build_orchestrator(&config, cli.dry_run).await?;
            let roles = orchestrator.rbac().list_bindings(&identity);
            futures::pin_mut!(roles);
            while let Some(role) = roles.try_next().await? {
                println!(
                    "{} {} ({}) rules={}",
                    role.scope().role_kind().as_str(),
                    role.name,
                    role.scope(),
                    role.rules.len()
                );
            }
        }
        Command::Verify { path } => {
            let config = load()?;
            let ca = load_ca(&config)?;
            let contents = fs::read_to_string(&path)?;
            let pem = match AccessBundle::from_yaml(&contents) {
                Ok(bundle) => bundle.client_certificate_pem()?,
                Err(_) => contents,
            };
            let ledger = open_ledger(&config, cli.dry_run)?;
            let report = verify_certificate(&pem, &ca, Some(&ledger))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != CertificateStatus::Valid {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Crl => {
            // Only the CA and the ledger are needed; no cluster connection
            let config = load()?;
            let ca = load_ca(&config)?;
            let signer = CertificateAuthoritySigner::new(
                Arc::new(open_ledger(&config, cli.dry_run)?),
                config.signing.clone(),
            );
            match config.crl_path() {
                Some(path) if !cli.dry_run => {
                    signer.publish_crl(&ca, &path, config.crl_next_update_days)?;
                    println!("Wrote {}", path.display());
                }
                _ => print!("{}", signer.render_crl(&ca, config.crl_next_update_days)?),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_config(path: &Path, force: bool) -> CliResult<()> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists; use --force to overwrite",
            path.display()
        )
        .into());
    }
    AccessConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn load_config(path: &Path) -> CliResult<AccessConfig> {
    if !path.exists() {
        return Err(format!(
            "no configuration at {}; run `kube-access init-config` first",
            path.display()
        )
        .into());
    }
    let config = AccessConfig::load_from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn init_ca(
    config: &AccessConfig,
    common_name: &str,
    days: u32,
    force: bool,
    dry_run: bool,
) -> CliResult<()> {
    let cert_path = config.ca_cert_path();
    let key_path = config.ca_key_path();
    if !force && (cert_path.exists() || key_path.exists()) {
        return Err(format!(
            "CA material already exists at {}; use --force to replace it",
            cert_path.display()
        )
        .into());
    }
    let ca = CaKeyMaterial::generate(common_name, days, config.key_spec)?;
    if dry_run {
        info!(fingerprint = %ca.fingerprint()?, "Dry run: CA not written");
        return Ok(());
    }
    ca.save(&cert_path, &key_path)?;
    println!(
        "Wrote CA {} (sha256 {}) to {}",
        common_name,
        ca.fingerprint()?,
        cert_path.display()
    );
    Ok(())
}

fn load_ca(config: &AccessConfig) -> kube_access::Result<CaKeyMaterial> {
    CaKeyMaterial::load(&config.ca_cert_path(), &config.ca_key_path())
}

fn open_ledger(config: &AccessConfig, dry_run: bool) -> kube_access::Result<IssuanceLedger> {
    if dry_run {
        Ok(IssuanceLedger::in_memory())
    } else {
        IssuanceLedger::open(config.ledger_path())
    }
}

async fn build_orchestrator(
    config: &AccessConfig,
    dry_run: bool,
) -> kube_access::Result<AccessLifecycleOrchestrator> {
    if !dry_run {
        let api: Arc<dyn ClusterApi> =
            Arc::new(KubeClusterApi::connect(config.kubeconfig_path().as_deref()).await?);
        return AccessLifecycleOrchestrator::from_config(config, api);
    }

    info!("Dry run: using in-memory ledger, registry and cluster API");
    let rbac = RbacReconciler::new(Arc::new(InMemoryClusterApi::new()), config.retry.clone())
        .with_call_timeout(config.api_timeout())
        .with_page_size(config.page_size);
    Ok(AccessLifecycleOrchestrator::new(
        KeyMaterialGenerator::new(config.key_spec)?,
        CertificateAuthoritySigner::new(
            Arc::new(IssuanceLedger::in_memory()),
            config.signing.clone(),
        ),
        Arc::new(BundleRegistry::in_memory()),
        rbac,
    )
    .with_revocation(config.revocation))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
