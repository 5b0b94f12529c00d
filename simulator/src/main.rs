//! Run a coin shuffle between in-process participants.
//!
//! Every participant is funded on a shared in-memory ledger, connected through a simulated
//! network, and run to completion. Misbehavior can be injected to watch the blame phase exclude
//! the responsible participants and retry without them.
//!
//! # Usage
//!
//! _To run this example, you must first install [Rust](https://www.rust-lang.org/tools/install)._
//!
//! ## Honest Session
//!
//! ```sh
//! cargo run --release --bin coinshuffle-simulator -- --participants 5
//! ```
//!
//! ## Isolated and Underfunded Participants
//!
//! Participant 1 runs but none of its messages are delivered. Participant 3 announces a coin
//! worth less than the amount (and refuses to start).
//!
//! ```sh
//! cargo run --release --bin coinshuffle-simulator -- --participants 6 --isolated 1 --underfunded 3 --metrics
//! ```

use bytes::Bytes;
use clap::{value_parser, Arg, ArgAction, Command};
use coinshuffle_cryptography::x25519;
use coinshuffle_p2p::simulated::{self, Network};
use coinshuffle_protocol::{mocks::Ledger, Config, Contribution, Machine, Outcome, SessionId};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey},
    PrivateKeyExt, Signer,
};
use commonware_utils::hex;
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info, warn};

/// Unique namespace to avoid message replay attacks.
const APPLICATION_NAMESPACE: &[u8] = b"_COINSHUFFLE_SIMULATOR";

fn main() {
    // Parse arguments
    let matches = Command::new("coinshuffle-simulator")
        .about("shuffle coins between in-process participants")
        .arg(
            Arg::new("participants")
                .long("participants")
                .required(false)
                .default_value("4")
                .value_parser(value_parser!(u64))
                .help("Number of participants"),
        )
        .arg(
            Arg::new("amount")
                .long("amount")
                .required(false)
                .default_value("100")
                .value_parser(value_parser!(u64))
                .help("Amount every participant shuffles"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .required(false)
                .default_value("500")
                .value_parser(value_parser!(u64))
                .help("Time to wait for a single packet (in milliseconds)"),
        )
        .arg(
            Arg::new("max-attempts")
                .long("max-attempts")
                .required(false)
                .default_value("4")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("isolated")
                .long("isolated")
                .required(false)
                .value_delimiter(',')
                .value_parser(value_parser!(u64))
                .help("Participants whose messages are never delivered"),
        )
        .arg(
            Arg::new("underfunded")
                .long("underfunded")
                .required(false)
                .value_delimiter(',')
                .value_parser(value_parser!(u64))
                .help("Participants funded with less than the amount"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .required(false)
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print the metrics of every participant once done"),
        )
        .get_matches();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Configure session
    let participants = *matches.get_one::<u64>("participants").unwrap();
    if participants < 2 {
        panic!("Please provide at least two participants");
    }
    let amount = *matches.get_one::<u64>("amount").unwrap();
    let timeout = Duration::from_millis(*matches.get_one::<u64>("timeout").unwrap());
    let max_attempts = *matches.get_one::<u32>("max-attempts").unwrap();
    let seed = *matches.get_one::<u64>("seed").unwrap();
    let isolated: Vec<u64> = matches
        .get_many::<u64>("isolated")
        .map(|values| values.copied().collect())
        .unwrap_or_default();
    let underfunded: Vec<u64> = matches
        .get_many::<u64>("underfunded")
        .map(|values| values.copied().collect())
        .unwrap_or_default();
    let print_metrics = matches.get_flag("metrics");

    // Generate identities
    let signers: Vec<PrivateKey> = (0..participants)
        .map(|index| PrivateKey::from_seed(seed.wrapping_add(index)))
        .collect();
    let keys: Vec<PublicKey> = signers.iter().map(|signer| signer.public_key()).collect();
    for (index, key) in keys.iter().enumerate() {
        info!(index, key = hex(key), "registered participant");
    }

    // Fund participants and prepare machines
    let network = Network::new(simulated::Config::default());
    let ledger = Ledger::default();
    let session = SessionId::new(&seed.to_be_bytes());
    let mut machines = Vec::new();
    let mut registries = Vec::new();
    for (index, signer) in signers.into_iter().enumerate() {
        let key = signer.public_key();
        let value = if underfunded.contains(&(index as u64)) {
            warn!(index, "underfunding participant");
            amount.saturating_sub(1)
        } else {
            amount
        };
        let contribution = Contribution {
            input: ledger.fund(&key, value),
            output: Bytes::from(format!("address-{index}")),
            change: None,
        };
        if isolated.contains(&(index as u64)) {
            warn!(index, "isolating participant");
            network.isolate(key.clone());
        }

        let registry = Arc::new(Mutex::new(Registry::with_prefix(format!(
            "participant_{index}"
        ))));
        let mut cfg = Config::new(APPLICATION_NAMESPACE, session, amount);
        cfg.registry = registry.clone();
        cfg.timeout = timeout;
        cfg.max_attempts = max_attempts;
        let (machine, _aborter) = Machine::<_, _, x25519::DecryptionKey, _, _>::new(
            StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
            cfg,
            signer,
            ledger.clone(),
            network.channel(key),
            keys.clone(),
            contribution,
        )
        .expect("failed to create participant");
        machines.push((index, machine));
        registries.push(registry);
    }

    // Run all participants
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create runtime");
    runtime.block_on(async move {
        let handles: Vec<_> = machines
            .into_iter()
            .map(|(index, machine)| (index, tokio::spawn(machine.run())))
            .collect();
        for (index, handle) in handles {
            match handle.await {
                Ok(Ok(Outcome::Completed {
                    transaction,
                    attempts,
                    excluded,
                })) => info!(
                    index,
                    attempts,
                    inputs = transaction.inputs.len(),
                    excluded = excluded.len(),
                    "completed"
                ),
                Ok(Ok(Outcome::Aborted {
                    attempts,
                    convicted,
                })) => warn!(index, attempts, convicted = convicted.len(), "aborted"),
                Ok(Err(err)) => error!(index, ?err, "failed"),
                Err(err) => error!(index, ?err, "participant panicked"),
            }
        }
    });

    // Summarize
    for transaction in ledger.submitted() {
        let outputs: Vec<String> = transaction
            .outputs
            .iter()
            .map(|output| String::from_utf8_lossy(output).into_owned())
            .collect();
        info!(
            inputs = transaction.inputs.len(),
            ?outputs,
            "transaction submitted"
        );
    }
    if print_metrics {
        for registry in registries {
            let mut buffer = String::new();
            encode(&mut buffer, &registry.lock().unwrap()).expect("failed to encode metrics");
            println!("{buffer}");
        }
    }
}
