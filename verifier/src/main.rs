// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dstack_app_auth::{
    AppAuthPolicy, InstanceId, JsonFileStore, ManifestDigest, PolicySnapshot, PolicyStore,
};
use dstack_attest::{Attestation, ReportDataHash, RootAuthority};
use dstack_kms::{Identity, SignatureChain};
use dstack_verifier::{
    binder, compare_attestation, Admission, Bound, Config, CvmVerifier, Malformed,
    MeasurementReport, ReferenceValues, Statement, VerificationRequest, Verdict,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

/// dstack CVM evidence verifier
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    trust: TrustArgs,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TrustArgs {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// PEM file with the quote root authority
    #[arg(long, global = true)]
    root_ca: Option<PathBuf>,
    /// Hash used to bind statements to report data
    #[arg(long, global = true)]
    report_data_hash: Option<ReportDataHash>,
    /// Address of the trusted KMS root
    #[arg(long, global = true)]
    kms_root: Option<Identity>,
    /// Expected app id (hex)
    #[arg(long, global = true)]
    app_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a statement is bound to report data
    Bind(BindArgs),
    /// Print the report data a quote must carry for a statement
    ReportData {
        /// Statement JSON file
        statement: PathBuf,
    },
    /// Verify the signer chain of a quote
    Quote {
        /// Attestation JSON or raw quote file
        attestation: PathBuf,
    },
    /// Compare the measurements of an attestation to reference values
    Measure {
        attestation: PathBuf,
        /// Reference values JSON file
        #[arg(long)]
        reference: Option<PathBuf>,
    },
    /// Verify a KMS signature chain
    Chain {
        /// Signature chain JSON file
        chain: PathBuf,
    },
    /// Evaluate the admission policy
    Admit {
        #[arg(long)]
        manifest: ManifestDigest,
        #[arg(long)]
        instance: String,
        /// Admission policy JSON file
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Administer an admission policy file
    Policy(PolicyArgs),
    /// Run the full pipeline: quote, binding, measurements, admission and chain
    Verify(VerifyArgs),
}

#[derive(Args)]
struct BindArgs {
    /// Statement JSON file
    statement: PathBuf,
    /// Report data (hex)
    #[arg(long, required_unless_present = "attestation")]
    report_data: Option<String>,
    /// Read the report data from this attestation after verifying its quote
    #[arg(long, conflicts_with = "report_data")]
    attestation: Option<PathBuf>,
}

#[derive(Args)]
struct PolicyArgs {
    /// Admission policy JSON file
    #[arg(long)]
    policy: Option<PathBuf>,
    #[clap(subcommand)]
    action: PolicyAction,
}

#[derive(Subcommand)]
enum PolicyAction {
    AddManifest { digest: ManifestDigest },
    RemoveManifest { digest: ManifestDigest },
    AllowAnyInstance {
        #[arg(action = clap::ArgAction::Set)]
        allow: bool,
    },
    AddInstance { id: String },
    RemoveInstance { id: String },
    Show,
}

#[derive(Args)]
struct VerifyArgs {
    /// Attestation JSON or raw quote file
    attestation: PathBuf,
    #[arg(long)]
    statement: Option<PathBuf>,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    chain: Option<PathBuf>,
    #[arg(long)]
    policy: Option<PathBuf>,
}

impl TrustArgs {
    /// Config file values, overridden by flags.
    fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(root_ca) = &self.root_ca {
            config.root_ca = Some(root_ca.clone());
        }
        if let Some(hash) = self.report_data_hash {
            config.report_data_hash = hash;
        }
        if let Some(kms_root) = self.kms_root {
            config.kms_root = Some(kms_root);
        }
        if let Some(app_id) = &self.app_id {
            let app_id = app_id.strip_prefix("0x").unwrap_or(app_id);
            config.app_id = Some(hex::decode(app_id).context("Invalid app id")?);
        }
        Ok(config)
    }
}

fn malformed(input: &str, path: &Path, err: impl std::fmt::Display) -> Malformed {
    Malformed::input(input, format!("{}: {err}", path.display()))
}

fn read_json<T: DeserializeOwned>(input: &str, path: &Path) -> Result<T, Malformed> {
    let bytes = fs_err::read(path).map_err(|e| Malformed::input(input, e))?;
    serde_json::from_slice(&bytes).map_err(|e| malformed(input, path, e))
}

fn read_statement(path: &Path) -> Result<Statement, Malformed> {
    let json = fs_err::read_to_string(path).map_err(|e| Malformed::input("statement", e))?;
    Statement::from_json(&json).map_err(|e| malformed("statement", path, e))
}

/// An attestation envelope, or a bare binary quote without event log.
///
/// Anything starting with `{` is taken as an envelope and must parse as one.
fn read_attestation(path: &Path) -> Result<Attestation, Malformed> {
    let bytes = fs_err::read(path).map_err(|e| Malformed::input("attestation", e))?;
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') {
        return serde_json::from_slice(&bytes).map_err(|e| malformed("attestation", path, e));
    }
    Ok(Attestation::new(bytes, vec![]))
}

/// Load a policy for evaluation. Unlike the admin commands, a missing file is an error.
fn read_policy(path: Option<&Path>) -> Result<PolicySnapshot, Malformed> {
    let path = path.ok_or_else(|| Malformed::input("policy", "no policy file given"))?;
    if !path.is_file() {
        return Err(malformed("policy", path, "no such policy file"));
    }
    JsonFileStore::new(path)
        .load()
        .map_err(|e| malformed("policy", path, format!("{e:#}")))
}

fn build_verifier(config: &Config) -> Result<CvmVerifier, Malformed> {
    let path = config
        .root_ca
        .as_deref()
        .ok_or_else(|| Malformed::input("root_ca", "no root authority given"))?;
    let pem = fs_err::read_to_string(path).map_err(|e| Malformed::input("root_ca", e))?;
    let root = RootAuthority::from_pem(&pem).map_err(|e| Malformed::InvalidRootAuthority {
        reason: e.to_string(),
    })?;
    let mut verifier = CvmVerifier::new(root).with_report_data_hash(config.report_data_hash);
    if let Some(kms_root) = config.kms_root {
        verifier = verifier.with_kms_root(kms_root);
    }
    if let Some(app_id) = &config.app_id {
        verifier = verifier.with_app_id(app_id.clone());
    }
    Ok(verifier)
}

fn emit<T: Serialize>(result: Result<Verdict<T>, Malformed>) -> Result<i32> {
    let verdict = result.unwrap_or_else(Verdict::Malformed);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    let code = verdict.exit_code();
    info!(code, "verdict emitted");
    Ok(code)
}

fn cmd_bind(config: &Config, args: &BindArgs) -> Result<Verdict<Bound>, Malformed> {
    let statement = read_statement(&args.statement)?;
    let report_data = match (&args.report_data, &args.attestation) {
        (Some(hex_str), _) => hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str))
            .map_err(|e| Malformed::input("report_data", e))?,
        (None, Some(path)) => {
            let attestation = read_attestation(path)?;
            match build_verifier(config)?.verify_attestation(&attestation, SystemTime::now()) {
                Verdict::Pass(verified) => verified.quote.report_data.to_vec(),
                Verdict::Fail(failures) => return Ok(Verdict::Fail(failures)),
                Verdict::Malformed(err) => return Err(err),
            }
        }
        (None, None) => return Err(Malformed::input("report_data", "no report data given")),
    };
    Ok(binder::bind_with_hash(&statement, &report_data, config.report_data_hash).into())
}

fn cmd_report_data(config: &Config, statement: &Path) -> Result<Verdict<Bound>, Malformed> {
    let statement = read_statement(statement)?;
    Ok(Verdict::Pass(Bound {
        report_data: binder::report_data(&statement, config.report_data_hash),
    }))
}

fn cmd_quote(
    config: &Config,
    attestation: &Path,
) -> Result<Verdict<dstack_attest::VerifiedQuote>, Malformed> {
    let attestation = read_attestation(attestation)?;
    Ok(build_verifier(config)?
        .verify_attestation(&attestation, SystemTime::now())
        .map(|verified| verified.quote))
}

fn cmd_measure(
    config: &Config,
    attestation: &Path,
    reference: Option<&Path>,
) -> Result<Verdict<MeasurementReport>, Malformed> {
    let attestation = read_attestation(attestation)?;
    let reference: ReferenceValues = match reference.or(config.reference_values.as_deref()) {
        Some(path) => read_json("reference_values", path)?,
        None => ReferenceValues::default(),
    };
    let verified = match build_verifier(config)?.verify_attestation(&attestation, SystemTime::now())
    {
        Verdict::Pass(verified) => verified,
        Verdict::Fail(failures) => return Ok(Verdict::Fail(failures)),
        Verdict::Malformed(err) => return Err(err),
    };
    let report = compare_attestation(&verified, &reference);
    let failures = report.mismatches.iter().cloned().map(Into::into).collect();
    Ok(Verdict::from_failures(report, failures))
}

fn cmd_chain(
    config: &Config,
    chain: &Path,
) -> Result<Verdict<dstack_kms::ChainReport>, Malformed> {
    let chain: SignatureChain = read_json("signature_chain", chain)?;
    let root = config
        .kms_root
        .ok_or_else(|| Malformed::input("kms_root", "no trusted KMS root given"))?;
    let app_id = config
        .app_id
        .as_deref()
        .ok_or_else(|| Malformed::input("app_id", "no expected app id given"))?;
    let report = dstack_kms::verify_chain(&chain, &root, app_id, &dstack_kms::Secp256k1Recovery);
    let failures = report.errors.iter().cloned().map(Into::into).collect();
    Ok(Verdict::from_failures(report, failures))
}

fn cmd_admit(
    config: &Config,
    manifest: ManifestDigest,
    instance: InstanceId,
    policy: Option<&Path>,
) -> Result<Verdict<Admission>, Malformed> {
    let snapshot = read_policy(policy.or(config.policy.as_deref()))?;
    Ok(snapshot
        .check(&manifest, &instance)
        .map(|()| Admission { manifest, instance })
        .into())
}

fn cmd_policy(config: &Config, args: PolicyArgs) -> Result<i32> {
    let path = args
        .policy
        .or_else(|| config.policy.clone())
        .context("No policy file given")?;
    let policy = AppAuthPolicy::open(JsonFileStore::new(&path))?;
    let changed = match args.action {
        PolicyAction::AddManifest { digest } => policy.add_allowed_manifest(digest)?,
        PolicyAction::RemoveManifest { digest } => policy.remove_allowed_manifest(digest)?,
        PolicyAction::AllowAnyInstance { allow } => policy.set_allow_any_instance(allow)?,
        PolicyAction::AddInstance { id } => policy.add_allowed_instance(InstanceId::new(id))?,
        PolicyAction::RemoveInstance { id } => {
            policy.remove_allowed_instance(InstanceId::new(id))?
        }
        PolicyAction::Show => false,
    };
    #[derive(Serialize)]
    struct PolicyOutput<'a> {
        changed: bool,
        policy: &'a PolicySnapshot,
    }
    let snapshot = policy.snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&PolicyOutput {
            changed,
            policy: &snapshot,
        })?
    );
    Ok(0)
}

fn cmd_verify(
    config: &Config,
    args: &VerifyArgs,
) -> Result<Verdict<dstack_verifier::VerificationReport>, Malformed> {
    let verifier = build_verifier(config)?;
    let mut request = VerificationRequest::new(read_attestation(&args.attestation)?);
    request.statement = args.statement.as_deref().map(read_statement).transpose()?;
    request.reference_values = args
        .reference
        .as_deref()
        .or(config.reference_values.as_deref())
        .map(|path| read_json("reference_values", path))
        .transpose()?;
    request.signature_chain = args
        .chain
        .as_deref()
        .map(|path| read_json("signature_chain", path))
        .transpose()?;
    let policy = args
        .policy
        .as_deref()
        .or(config.policy.as_deref())
        .map(|path| read_policy(Some(path)))
        .transpose()?;
    Ok(verifier.verify(&request, policy.as_ref(), SystemTime::now()))
}

fn run(cli: Cli) -> Result<i32> {
    let config = cli.trust.resolve()?;
    match cli.command {
        Commands::Bind(args) => emit(cmd_bind(&config, &args)),
        Commands::ReportData { statement } => emit(cmd_report_data(&config, &statement)),
        Commands::Quote { attestation } => emit(cmd_quote(&config, &attestation)),
        Commands::Measure {
            attestation,
            reference,
        } => emit(cmd_measure(&config, &attestation, reference.as_deref())),
        Commands::Chain { chain } => emit(cmd_chain(&config, &chain)),
        Commands::Admit {
            manifest,
            instance,
            policy,
        } => emit(cmd_admit(
            &config,
            manifest,
            InstanceId::new(instance),
            policy.as_deref(),
        )),
        Commands::Policy(args) => cmd_policy(&config, args),
        Commands::Verify(args) => emit(cmd_verify(&config, &args)),
    }
}

fn main() {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:?}");
            2
        }
    };
    std::process::exit(code);
}
