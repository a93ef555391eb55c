use std::rc::Rc;
use std::time::Duration;

use eyre::{eyre, WrapErr};
use serde_json::Value;
use signkit_core::collaborators::TransactionBuilder;
use signkit_core::memory::{
    MemoryAuthenticator, MemoryChannel, MemoryFrameHost, MemoryStorage, MemoryTransactionBuilder,
    MemoryWindowHost, ScriptedSurface, SurfaceBehavior,
};
use signkit_core::{
    Clock, CredentialRecord, DialogError, MessageType, NegotiatorConfig, Origin, Platform,
    SessionNegotiator, SessionStore, TokioClock,
};

use crate::{ActionArg, SimulateArgs, SurfaceArg};

const FOREIGN_ORIGIN: &str = "https://impostor.example.net";
const DISMISS_AFTER: Duration = Duration::from_millis(300);

fn load_config(args: &SimulateArgs) -> eyre::Result<NegotiatorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            NegotiatorConfig::from_json(&json)?
        }
        None => NegotiatorConfig::new(&args.authority_url)?,
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    Ok(config)
}

fn describe(error: &DialogError) -> eyre::Report {
    eyre!("{} ({})", error, error.code())
}

fn build_surface(
    args: &SimulateArgs,
    channel: &MemoryChannel,
    authority: &Origin,
    clock: &Rc<dyn Clock>,
) -> ScriptedSurface {
    let mut surface = ScriptedSurface::new(
        channel,
        authority,
        Rc::clone(clock),
        Rc::new(MemoryAuthenticator::new(&args.credential_id, &[1, 2, 3])),
    )
    .with_latency(Duration::from_millis(args.latency_ms));
    surface = match args.surface {
        SurfaceArg::Respond => surface,
        SurfaceArg::Silent | SurfaceArg::Dismiss => surface.with_behavior(SurfaceBehavior::Silent),
        SurfaceArg::Close => surface.with_behavior(SurfaceBehavior::Close),
        SurfaceArg::Impersonate => surface.impersonating(FOREIGN_ORIGIN),
    };
    if let Some(address) = &args.smart_wallet_address {
        surface = surface.with_smart_wallet_address(address);
    }
    if args.request_credentials {
        surface = surface.requesting_credentials();
    }
    if args.ack_sync {
        surface = surface.acknowledging_sync();
    }
    surface
}

pub async fn run(args: &SimulateArgs) -> eyre::Result<()> {
    let config = load_config(args)?;
    let authority = config.authority_origin()?;

    let channel = MemoryChannel::new();
    let storage = MemoryStorage::new();
    let windows = MemoryWindowHost::with_channel(&channel);
    let frames = MemoryFrameHost::with_channel(&channel);
    let clock: Rc<dyn Clock> = Rc::new(TokioClock::new());

    if let Some(credential_id) = &args.stored {
        SessionStore::new(storage.clone()).save(&CredentialRecord {
            credential_id: credential_id.clone(),
            public_key: vec![1, 2, 3],
            derived_address: None,
            updated_at: clock.now_ms(),
        })?;
    }

    let negotiator = SessionNegotiator::new(
        config,
        Platform {
            environment: args.platform.environment(),
            clock: Rc::clone(&clock),
            storage,
            windows: windows.clone(),
            frames: frames.clone(),
        },
        &channel,
    )?;

    let surface = build_surface(args, &channel, &authority, &clock);

    let negotiation = async {
        match args.action {
            ActionArg::Connect => negotiator
                .negotiate_connect()
                .await
                .and_then(|outcome| serde_json::to_value(outcome).map_err(DialogError::from)),
            ActionArg::Sign => negotiator
                .negotiate_sign(args.message.as_bytes())
                .await
                .and_then(|outcome| serde_json::to_value(outcome).map_err(DialogError::from)),
        }
    };
    let user = async {
        if args.surface != SurfaceArg::Dismiss {
            return std::future::pending().await;
        }
        tokio::time::sleep(DISMISS_AFTER).await;
        tracing::info!("user dismisses the surface");
        frames.dismiss();
        if let Some(window) = windows.last_window() {
            window.close_by_user();
        }
        std::future::pending::<()>().await;
    };

    let served = surface.run();
    tokio::pin!(negotiation, served, user);
    let mut surface_done = false;
    let result = loop {
        tokio::select! {
            biased;
            result = &mut negotiation => break result,
            () = &mut served, if !surface_done => surface_done = true,
            () = &mut user => {}
        }
    };

    let transcript: Vec<String> = surface
        .received()
        .iter()
        .map(|envelope| envelope.kind.to_string())
        .collect();
    tracing::info!(messages = ?transcript, "surface received");
    tracing::info!(
        sync_pushes = surface.received_count(MessageType::SyncCredentials),
        "credential sync"
    );

    let outcome = result.map_err(|err| describe(&err))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let Some(instruction) = &args.instruction {
        print_transaction(&outcome, instruction).await?;
    }

    if let Some(record) = negotiator.session()? {
        tracing::info!(credential_id = %record.credential_id, "stored session");
    }
    Ok(())
}

async fn print_transaction(outcome: &Value, instruction: &str) -> eyre::Result<()> {
    let instruction: Value = serde_json::from_str(instruction).wrap_err("parsing --instruction")?;
    let signature = serde_json::from_value(outcome["signature"].clone())
        .wrap_err("outcome carries no signature")?;
    let transaction = MemoryTransactionBuilder
        .build_authorized_transaction(&signature, &instruction)
        .await
        .map_err(|err| describe(&err))?;
    println!("{}", serde_json::to_string_pretty(&transaction)?);
    Ok(())
}
