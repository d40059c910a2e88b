//! Command-line front end for the quorum bridge.
//!
//! `setup` runs the parameter ceremony and pins the result with a manifest,
//! `inspect-setup` checks a manifest against its file, and `demo` drives a
//! simulated source chain through the engine with both proof kinds.

use std::{
    env,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use quorum_bridge::circuit::CircuitShape;
use quorum_bridge::simulate::Committee;
use quorum_bridge::{
    load_setup, trusted_setup, write_setup, BridgeConfig, ChainState, ProofKind, ProvingPipeline,
    QuorumCertificate, SetupManifest, VerificationEngine, VerificationReport, VerifiedHead,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("setup") => cmd_setup(args.collect()),
        Some("inspect-setup") => {
            let path = args
                .next()
                .unwrap_or_else(|| fatal("Usage: bridge inspect-setup <manifest.json>"));
            cmd_inspect_setup(Path::new(&path));
        }
        Some("demo") => cmd_demo(args.collect()),
        _ => {
            eprintln!("Usage: bridge <setup|inspect-setup|demo> ...");
            eprintln!("  setup --steps <N> --validators <N> --out <file> [--seed <u64>]");
            eprintln!("  inspect-setup <manifest.json>");
            eprintln!("  demo [--config <file>] [--wrapped] [--checkpoint-dir <dir>]");
            std::process::exit(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    let value = value.unwrap_or_else(|| fatal(&format!("{flag} expects a value")));
    value
        .parse()
        .unwrap_or_else(|_| fatal(&format!("invalid {flag} value: {value}")))
}

fn manifest_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_owned();
    name.push(".manifest.json");
    PathBuf::from(name)
}

fn cmd_setup(args: Vec<String>) {
    let mut steps: Option<usize> = None;
    let mut validators: Option<usize> = None;
    let mut out: Option<PathBuf> = None;
    let mut seed: Option<u64> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--steps" => steps = Some(parse_value("--steps", iter.next())),
            "--validators" => validators = Some(parse_value("--validators", iter.next())),
            "--out" => out = Some(PathBuf::from(parse_value::<String>("--out", iter.next()))),
            "--seed" => seed = Some(parse_value("--seed", iter.next())),
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let shape = CircuitShape {
        max_steps: steps.unwrap_or_else(|| fatal("--steps is required")),
        max_validators: validators.unwrap_or_else(|| fatal("--validators is required")),
    };
    let out = out.unwrap_or_else(|| fatal("--out is required"));
    let mut rng = match seed {
        Some(seed) => {
            eprintln!("warning: seeded setup is for testing only");
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };

    let params =
        trusted_setup(shape, &mut rng).unwrap_or_else(|err| fatal(&format!("setup failed: {err}")));
    let manifest =
        write_setup(&params, &out).unwrap_or_else(|err| fatal(&format!("write failed: {err}")));
    let json = serde_json::to_string_pretty(&manifest)
        .unwrap_or_else(|err| fatal(&format!("manifest encoding failed: {err}")));
    let manifest_file = manifest_path(&out);
    fs::write(&manifest_file, &json)
        .unwrap_or_else(|err| fatal(&format!("failed to write {}: {err}", manifest_file.display())));
    println!("setup written to {}", out.display());
    println!("manifest written to {}", manifest_file.display());
    println!("{json}");
}

fn read_manifest(path: &Path) -> SetupManifest {
    let contents = fs::read_to_string(path)
        .unwrap_or_else(|err| fatal(&format!("failed to read {}: {err}", path.display())));
    serde_json::from_str(&contents)
        .unwrap_or_else(|err| fatal(&format!("invalid manifest {}: {err}", path.display())))
}

fn cmd_inspect_setup(path: &Path) {
    let manifest = read_manifest(path);
    let params = load_setup(&manifest).unwrap_or_else(|err| fatal(&format!("{err}")));
    println!("version:        {}", params.version);
    println!("max_steps:      {}", params.shape.max_steps);
    println!("max_validators: {}", params.shape.max_validators);
    println!("digest:         {}", hex::encode(manifest.digest));
    println!("path:           {}", manifest.path.display());
}

fn print_head(label: &str, head: &VerifiedHead) {
    println!(
        "{label:<28} epoch={} height={} root={} set={}",
        head.epoch,
        head.height,
        &hex::encode(head.state_root)[..16],
        &hex::encode(head.validator_set_commitment)[..16]
    );
}

fn print_report(label: &str, report: &VerificationReport) {
    let certificates = report
        .certificates
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{label:<28} kind={} certificates={certificates} verify_us={}",
        report.kind, report.elapsed_us
    );
    print_head("", &report.head);
}

fn cmd_demo(args: Vec<String>) {
    let mut config_path: Option<PathBuf> = None;
    let mut wrapped = false;
    let mut checkpoint_dir: Option<PathBuf> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(parse_value::<String>("--config", iter.next())))
            }
            "--wrapped" => wrapped = true,
            "--checkpoint-dir" => {
                checkpoint_dir = Some(PathBuf::from(parse_value::<String>(
                    "--checkpoint-dir",
                    iter.next(),
                )))
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let config = match config_path {
        Some(path) => BridgeConfig::load(&path).unwrap_or_else(|err| fatal(&format!("{err}"))),
        None => BridgeConfig::default(),
    };

    let setup = if wrapped {
        let manifest = config
            .setup
            .as_ref()
            .unwrap_or_else(|| fatal("--wrapped needs a setup manifest in the config"));
        let params = load_setup(manifest).unwrap_or_else(|err| fatal(&format!("{err}")));
        Some(Arc::new(params))
    } else {
        None
    };

    let first = Committee::new(b"demo-epoch-0", &[10, 10, 10, 10]);
    let second = Committee::new(b"demo-epoch-1", &[7, 7, 7]);
    let mut engine = VerificationEngine::genesis(
        &first.genesis_ledger_info(),
        first.set().clone(),
        config.engine.clone(),
    );
    let mut pipeline = ProvingPipeline::new(config.prover.clone());
    if let Some(params) = &setup {
        engine = engine.with_verifier_keys(Arc::new(params.verifier_keys()));
        pipeline = pipeline.with_setup(Arc::clone(params));
    }
    let sets = [first.set().clone(), second.set().clone()];
    print_head("genesis", &engine.head());

    let qc = first.certify(first.ledger_info(0, 1, None), &[0, 1, 2]);
    let head = engine
        .verify_and_advance(&qc)
        .unwrap_or_else(|err| fatal(&format!("certificate rejected: {err}")));
    print_head("certificate (3 of 4)", &head);
    match engine.verify_and_advance(&qc) {
        Ok(_) => fatal("replayed certificate was accepted"),
        Err(err) => println!("{:<28} {err}", "replay rejected"),
    }

    let prove = |start: &ChainState, certificates: &[QuorumCertificate], kind: ProofKind| {
        pipeline
            .prove(start, &sets, certificates, kind)
            .unwrap_or_else(|err| fatal(&format!("proving failed: {err}")))
    };

    let batch: Vec<QuorumCertificate> = [3, 5, 6]
        .iter()
        .map(|&h| first.certify_all(first.ledger_info(0, h, None)))
        .collect();
    let proof = prove(&engine.chain_state(), &batch, ProofKind::Native);
    let report = engine
        .submit_with_report(&proof)
        .unwrap_or_else(|err| fatal(&format!("proof rejected: {err}")));
    print_report("native batch", &report);

    let boundary = [first.certify(
        first.ledger_info(0, 8, Some(second.set().clone())),
        &[0, 1, 3],
    )];
    let opening: Vec<QuorumCertificate> = (0..2)
        .map(|h| second.certify(second.ledger_info(1, h, None), &[0, 2]))
        .collect();
    let left = prove(&engine.chain_state(), &boundary, ProofKind::Native);
    let right = prove(&ChainState::from_batch_end(&left), &opening, ProofKind::Native);
    let merged = pipeline
        .aggregate(&[left, right])
        .unwrap_or_else(|err| fatal(&format!("aggregation failed: {err}")));
    let report = engine
        .submit_with_report(&merged)
        .unwrap_or_else(|err| fatal(&format!("aggregate rejected: {err}")));
    print_report("aggregate across epoch", &report);

    if setup.is_some() {
        let batch = [second.certify_all(second.ledger_info(1, 4, None))];
        let proof = prove(&engine.chain_state(), &batch, ProofKind::WrappedSuccinct);
        println!("{:<28} {} bytes", "wrapped proof", proof.proof_bytes.len());
        let report = engine
            .submit_with_report(&proof)
            .unwrap_or_else(|err| fatal(&format!("wrapped proof rejected: {err}")));
        print_report("wrapped batch", &report);
    }

    if let Some(dir) = checkpoint_dir {
        let path = engine
            .save_checkpoint(&dir)
            .unwrap_or_else(|err| fatal(&format!("{err}")));
        println!("{:<28} {}", "checkpoint", path.display());
    }
    print_head("final head", &engine.head());
}
