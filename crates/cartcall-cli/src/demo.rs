//! Offline demo: plays a scripted shopping call through the real orchestrator

use cartcall_session::{Phase, SessionHandle};
use cartcall_transport::{RawEvent, ScriptedTransport, TransportErrorKind};
use serde_json::json;
use std::time::Duration;

/// How long to wait for the orchestrator to recover a dropped connection
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

struct Script<'a> {
    transport: &'a ScriptedTransport,
    step: Duration,
}

impl Script<'_> {
    async fn pause(&self) {
        tokio::time::sleep(self.step).await;
    }

    async fn send(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        if !self.transport.emit_json(payload) {
            anyhow::bail!("demo connection is not open");
        }
        self.pause().await;
        Ok(())
    }

    async fn raw(&self, event: RawEvent) -> anyhow::Result<()> {
        if !self.transport.emit(event) {
            anyhow::bail!("demo connection is not open");
        }
        self.pause().await;
        Ok(())
    }

    async fn user(&self, seq: u64, partial: &str, text: &str) -> anyhow::Result<()> {
        self.send(json!({"type": "user_speech_started"})).await?;
        self.send(json!({"type": "transcript", "speaker": "user", "text": partial, "seq": seq}))
            .await?;
        self.send(json!({"type": "user_speech_stopped"})).await?;
        self.send(json!({"type": "transcript", "speaker": "user", "text": text, "seq": seq, "final": true}))
            .await
    }

    async fn agent(&self, seq: u64, text: &str) -> anyhow::Result<()> {
        self.raw(RawEvent::RemoteAudioStarted {
            track_id: "agent-voice".into(),
        })
        .await?;
        self.send(json!({"type": "transcript", "speaker": "assistant", "text": text, "seq": seq, "final": true}))
            .await?;
        self.raw(RawEvent::RemoteAudioStopped {
            track_id: "agent-voice".into(),
        })
        .await
    }

    async fn tool(&self, id: &str, name: &str, arguments: serde_json::Value, seq: u64) -> anyhow::Result<()> {
        self.send(json!({"type": "tool_call", "id": id, "name": name, "arguments": arguments, "seq": seq}))
            .await?;
        self.send(json!({"type": "tool_result", "id": id, "status": "applied"}))
            .await
    }
}

/// Play the demo call. Returns once the order has been placed.
///
/// Halfway through, the connection is dropped to show recovery with the
/// conversation and cart intact.
pub async fn play(
    transport: ScriptedTransport,
    handle: SessionHandle,
    step: Duration,
) -> anyhow::Result<()> {
    let script = Script {
        transport: &transport,
        step,
    };
    handle.wait_for_phase(Phase::Active).await?;
    script.pause().await;

    script.user(1, "show me", "show me hoodies").await?;
    script
        .tool("t1", "search_products", json!({"query": "hoodie"}), 2)
        .await?;

    // The shopper talks over the agent
    script
        .raw(RawEvent::RemoteAudioStarted {
            track_id: "agent-voice".into(),
        })
        .await?;
    script
        .send(json!({"type": "transcript", "speaker": "assistant", "text": "We have a black hoodie and a grey", "seq": 3}))
        .await?;
    script.user(4, "the black", "the black one in medium please").await?;
    script
        .tool("t2", "add_to_cart", json!({"item": "hoodie-black-M", "qty": 1}), 5)
        .await?;
    script.agent(6, "Added the black hoodie in medium.").await?;

    transport.drop_connection(TransportErrorKind::Network, "demo network blip");
    handle.wait_for_phase(Phase::Reconnecting).await?;
    if handle
        .wait_for_phase_timeout(Phase::Active, RECOVERY_TIMEOUT)
        .await
        .is_none()
    {
        anyhow::bail!("demo call did not recover");
    }
    script.pause().await;

    script.user(7, "and two", "and two mugs in blue").await?;
    script
        .tool(
            "t3",
            "add_to_cart",
            json!({"item": "mug", "qty": 2, "variant": "blue"}),
            8,
        )
        .await?;
    script.agent(9, "Two blue mugs, done. Ready to order?").await?;
    script.user(10, "yes", "yes, order it for Ana").await?;
    script
        .tool("t4", "place_order", json!({"customer_name": "Ana"}), 11)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartcall_session::{Orchestrator, SessionConfig};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_demo_call_completes_with_order() {
        let transport = ScriptedTransport::new();
        let handle = Orchestrator::spawn(SessionConfig::default(), Arc::new(transport.clone()));
        handle.start_call().await.unwrap();

        play(transport.clone(), handle.clone(), Duration::from_millis(50))
            .await
            .unwrap();
        let snapshot = handle.wait_for_phase(Phase::Ended).await.unwrap();

        assert_eq!(snapshot.cart.summary(), "1x hoodie-black-M, 2x mug (blue)");
        assert!(snapshot.cart.order_confirmed);
        assert_eq!(snapshot.stats.reconnects, 1);
        assert!(snapshot.stats.barge_ins >= 1);
        assert!(transport.interrupt_count() >= 1);
        assert!(snapshot.turns.iter().all(|t| t.is_final));
        assert_eq!(transport.connect_count(), 2);
        assert!(!transport.is_connected());
    }
}
