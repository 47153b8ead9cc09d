//! Two tabs against one in-process relay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tabguard::{GuardEvent, MemoryStore, SystemClock, TabContext};
use tabguard_protocol::WorkerMessage;
use tabguard_relay::{Relay, WorkerPhase};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

use super::CommandContext;
use crate::output::ErrorCode;

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct Step {
	step: &'static str,
	detail: Value,
}

pub async fn execute(ctx: &CommandContext) -> Result<()> {
	match run(ctx).await {
		Ok(steps) => {
			ctx.print("relay-demo", json!({ "steps": steps }));
			Ok(())
		}
		Err(err) => {
			ctx.print_error("relay-demo", ErrorCode::RelayError, format!("{err:#}"));
			Err(err)
		}
	}
}

async fn run(ctx: &CommandContext) -> Result<Vec<Step>> {
	let clock = Arc::new(SystemClock);
	let (relay, _task) = Relay::spawn(ctx.config.relay.clone(), clock.clone());
	// Tabs share an origin, so they share one in-memory store.
	let store = Arc::new(MemoryStore::new());
	let first = TabContext::connect(&relay, ctx.config.clone(), store.clone(), clock.clone())?;
	let second = TabContext::connect(&relay, ctx.config.clone(), store, clock)?;
	let mut steps = Vec::new();

	let (updates_tx, mut updates) = mpsc::unbounded_channel();
	second.client().add_listener("chat-1", move |message: &WorkerMessage| {
		let _ = updates_tx.send(message.clone());
	});
	let mut second_events = second.events().subscribe();

	first.client().register_session("chat-1", &json!({ "userId": "demo", "messages": [{ "role": "user", "content": "hello" }] }));
	let update = timeout(STEP_TIMEOUT, updates.recv()).await.context("second tab never heard the registration")?;
	steps.push(Step {
		step: "register",
		detail: json!({ "seenBySecondTab": update }),
	});

	let cached = second.client().get_session("chat-1").await;
	steps.push(Step {
		step: "rehydrate",
		detail: json!({ "session": cached }),
	});

	first.client().register_session("chat-2", &json!({ "userId": "demo" }));
	let replaced = timeout(STEP_TIMEOUT, async {
		loop {
			match second_events.recv().await {
				Ok(GuardEvent::SessionReplaced { old_session_id, new_session_id }) => return Some((old_session_id, new_session_id)),
				Ok(_) => continue,
				Err(_) => return None,
			}
		}
	})
	.await
	.ok()
	.flatten()
	.context("second tab never heard the replacement")?;
	steps.push(Step {
		step: "multi-open",
		detail: json!({
			"oldSessionId": replaced.0,
			"newSessionId": replaced.1,
			"oldSessionCached": second.client().get_session("chat-1").await.is_some(),
		}),
	});

	second.activity().set_streaming(true);
	// Round trip so the relay has seen the streaming flag.
	second.client().get_session("chat-2").await;
	let activation = relay.install_update().await?;
	let phase_while_streaming = relay.phase();
	second.activity().set_streaming(false);
	let mut phase = relay.watch_phase();
	timeout(STEP_TIMEOUT, phase.wait_for(|phase| *phase == WorkerPhase::Active))
		.await
		.context("update never activated")??;
	steps.push(Step {
		step: "deferred-activation",
		detail: json!({
			"activation": activation,
			"phaseWhileStreaming": phase_while_streaming,
			"phaseAfterStreaming": relay.phase(),
		}),
	});

	steps.push(Step {
		step: "status",
		detail: serde_json::to_value(relay.status().await?)?,
	});
	info!(target = "tabguard.relay", steps = steps.len(), "relay demo finished");

	first.teardown();
	second.teardown();
	relay.shutdown();
	Ok(steps)
}
