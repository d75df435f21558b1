use super::{DecodeContext, Operation, OperationContext, TopologyReaction};
use crate::codec::wire::read_string;
use crate::codec::{
    read_response_header, write_request_header, ProtocolVersion, RequestHeader, ResponseHeader,
};
use crate::error::{ClientError, Result};
use crate::metrics::{self, OperationTimer};
use crate::topology::ClientTopology;
use crate::transport::{ChannelGuard, ChannelTarget};
use crate::types::{Flags, NodeAddress};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Lifecycle of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Created,
    ChannelAcquired,
    Sent,
    AwaitingResponse,
    Completed,
    RetryTopology,
    Failed,
    Abandoned,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed
                | OperationState::RetryTopology
                | OperationState::Failed
                | OperationState::Abandoned
        )
    }

    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Created, ChannelAcquired)
                | (Created, RetryTopology)
                | (Created, Failed)
                | (Created, Abandoned)
                | (ChannelAcquired, Sent)
                | (ChannelAcquired, RetryTopology)
                | (ChannelAcquired, Failed)
                | (ChannelAcquired, Abandoned)
                | (Sent, AwaitingResponse)
                | (AwaitingResponse, Completed)
                | (AwaitingResponse, RetryTopology)
                | (AwaitingResponse, Failed)
                | (AwaitingResponse, Abandoned)
        )
    }
}

/// How an attempt ended
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Completed(T),
    /// The server answered with a newer topology
    RetryTopology,
    /// Transport trouble or a transient server state
    RetryConnectivity(ClientError),
    Failed(ClientError),
}

impl<T> Outcome<T> {
    fn state(&self) -> OperationState {
        match self {
            Outcome::Completed(_) => OperationState::Completed,
            Outcome::RetryTopology | Outcome::RetryConnectivity(_) => {
                OperationState::RetryTopology
            }
            Outcome::Failed(_) => OperationState::Failed,
        }
    }
}

pub(crate) struct Attempt<O: Operation> {
    ctx: Arc<OperationContext>,
    op: Arc<O>,
    flags: Flags,
    topology: Arc<ClientTopology>,
    message_id: u64,
    state: OperationState,
}

impl<O: Operation> Attempt<O> {
    pub(crate) fn new(
        ctx: Arc<OperationContext>,
        op: Arc<O>,
        flags: Flags,
        topology: Arc<ClientTopology>,
    ) -> Self {
        let message_id = ctx.next_message_id();
        Self {
            ctx,
            op,
            flags,
            topology,
            message_id,
            state: OperationState::Created,
        }
    }

    fn transition(&mut self, next: OperationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(
            "Message {} ({}): {:?} -> {:?}",
            self.message_id,
            self.op.op_code().name(),
            self.state,
            next
        );
        self.state = next;
    }

    fn timeout(&self, target: &ChannelTarget, stage: &str) -> ClientError {
        ClientError::Timeout(format!(
            "{} to {} timed out while {}",
            self.op.op_code().name(),
            target,
            stage
        ))
    }

    pub(crate) async fn run(mut self, target: ChannelTarget, deadline: Instant) -> Outcome<O::Output> {
        let op_name = self.op.op_code().name();
        let provider = Arc::clone(&self.ctx.provider);

        let channel =
            match tokio::time::timeout_at(deadline, provider.acquire_channel(&target)).await {
                Err(_) => {
                    self.transition(OperationState::Abandoned);
                    metrics::record_abandoned(op_name);
                    return Outcome::Failed(self.timeout(&target, "acquiring a channel"));
                }
                Ok(Err(e)) if e.is_retriable() => {
                    self.transition(OperationState::RetryTopology);
                    return Outcome::RetryConnectivity(e);
                }
                Ok(Err(e)) => {
                    self.transition(OperationState::Failed);
                    return Outcome::Failed(e);
                }
                Ok(Ok(channel)) => channel,
            };
        self.transition(OperationState::ChannelAcquired);

        let version = provider.negotiated_codec_version(channel.as_ref());
        let address = channel.address().clone();
        let mut guard = ChannelGuard::new(Arc::clone(&provider), channel);
        let timer = OperationTimer::new(op_name, &address.to_string());

        let frame = self.encode(version);
        match tokio::time::timeout_at(deadline, guard.write_frame(frame)).await {
            Err(_) => {
                self.transition(OperationState::Abandoned);
                metrics::record_abandoned(op_name);
                timer.error("timeout");
                guard.discard("write timed out");
                return Outcome::Failed(self.timeout(&target, "writing the request"));
            }
            Ok(Err(e)) => {
                self.transition(OperationState::RetryTopology);
                timer.error(e.error_type());
                guard.discard("write failed");
                return Outcome::RetryConnectivity(e);
            }
            Ok(Ok(())) => {}
        }
        self.transition(OperationState::Sent);
        self.transition(OperationState::AwaitingResponse);

        let frame = match tokio::time::timeout_at(deadline, guard.read_frame()).await {
            Err(_) => {
                self.transition(OperationState::Abandoned);
                metrics::record_abandoned(op_name);
                timer.error("timeout");
                self.spawn_drain(guard);
                return Outcome::Failed(self.timeout(&target, "awaiting the response"));
            }
            Ok(Err(e)) => {
                self.transition(OperationState::RetryTopology);
                timer.error(e.error_type());
                guard.discard("read failed");
                return Outcome::RetryConnectivity(e);
            }
            Ok(Ok(frame)) => frame,
        };

        match self.handle_response(frame, version, &address) {
            Ok(outcome) => {
                guard.release();
                match &outcome {
                    Outcome::Failed(e) => timer.error(e.error_type()),
                    Outcome::RetryConnectivity(e) => timer.error(e.error_type()),
                    Outcome::RetryTopology => timer.error("topology_changed"),
                    Outcome::Completed(_) => timer.success(),
                }
                self.transition(outcome.state());
                outcome
            }
            Err(e) => {
                warn!("Bad response from {} for {}: {}", address, op_name, e);
                timer.error(e.error_type());
                guard.discard("malformed response");
                self.transition(OperationState::Failed);
                Outcome::Failed(e)
            }
        }
    }

    fn encode(&self, version: ProtocolVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        let header = RequestHeader {
            message_id: self.message_id,
            version,
            op_code: self.op.op_code().code(),
            cache_name: self.ctx.cache_name.clone(),
            flags: self.flags,
            intelligence: self.ctx.registry.intelligence(),
            topology_id: self.topology.epoch(),
        };
        write_request_header(&mut buf, &header);
        self.op.encode(version, &mut buf);
        buf.freeze()
    }

    /// Interpret a response frame. `Err` means the channel can no longer be
    /// trusted; every other result leaves it reusable.
    fn handle_response(
        &self,
        mut body: Bytes,
        version: ProtocolVersion,
        address: &NodeAddress,
    ) -> Result<Outcome<O::Output>> {
        let header: ResponseHeader =
            read_response_header(&mut body, self.ctx.registry.intelligence())?;
        if header.message_id != self.message_id {
            return Err(ClientError::Protocol(format!(
                "Response for message {} while awaiting {}",
                header.message_id, self.message_id
            )));
        }

        if let Some(update) = header.topology {
            let epoch = update.topology_id;
            let applied = self.ctx.apply_topology(update)?;
            debug!(
                "{} answered {} with topology {} (applied: {})",
                address,
                self.op.op_code().name(),
                epoch,
                applied
            );
            if self.op.on_topology_changed() == TopologyReaction::Retry {
                return Ok(Outcome::RetryTopology);
            }
        }

        if header.status.is_error() {
            let message = read_string(&mut body).unwrap_or_default();
            let error = ClientError::Server {
                status: header.status.0,
                message,
            };
            if header.status.is_transient_error() {
                return Ok(Outcome::RetryConnectivity(error));
            }
            return Ok(Outcome::Failed(error));
        }

        if header.op_code != self.op.op_code().response_code() {
            return Err(ClientError::Protocol(format!(
                "Unexpected response opcode {:#04x} for {}",
                header.op_code,
                self.op.op_code().name()
            )));
        }

        let ctx = DecodeContext { version, address };
        match self.op.decode(header.status, &mut body, &ctx) {
            Ok(output) => Ok(Outcome::Completed(output)),
            Err(e) if e.poisons_channel() => Err(e),
            Err(e) => Ok(Outcome::Failed(e)),
        }
    }

    /// Keep reading on behalf of an abandoned request so the channel can be
    /// reused once its late response has been consumed
    fn spawn_drain(&self, mut guard: ChannelGuard) {
        let ctx = Arc::clone(&self.ctx);
        let message_id = self.message_id;
        tokio::spawn(async move {
            match tokio::time::timeout(ctx.config.drain_timeout(), guard.read_frame()).await {
                Ok(Ok(mut frame)) => {
                    match read_response_header(&mut frame, ctx.registry.intelligence()) {
                        Ok(header) if header.message_id == message_id => {
                            if let Some(update) = header.topology {
                                if let Err(e) = ctx.apply_topology(update) {
                                    warn!("Ignoring topology in late response: {}", e);
                                }
                            }
                            debug!("Drained late response for message {}", message_id);
                            guard.release();
                        }
                        Ok(header) => guard.discard(&format!(
                            "late response for message {} instead of {}",
                            header.message_id, message_id
                        )),
                        Err(_) => guard.discard("malformed late response"),
                    }
                }
                Ok(Err(_)) => guard.discard("late read failed"),
                Err(_) => guard.discard("no late response"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::factory::{CallContext, OperationsFactory};
    use crate::test_support::{addr, FakeCluster};
    use std::time::Duration;
    use OperationState::*;

    const ALL: [OperationState; 8] = [
        Created,
        ChannelAcquired,
        Sent,
        AwaitingResponse,
        Completed,
        RetryTopology,
        Failed,
        Abandoned,
    ];

    #[test]
    fn test_happy_path_transitions() {
        let path = [Created, ChannelAcquired, Sent, AwaitingResponse, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_completion_requires_a_response() {
        assert!(!Created.can_transition_to(Completed));
        assert!(!ChannelAcquired.can_transition_to(Completed));
        assert!(!Sent.can_transition_to(Completed));
    }

    #[test]
    fn test_outcome_maps_retries_to_retry_state() {
        let retry: Outcome<()> = Outcome::RetryConnectivity(ClientError::Connection("x".into()));
        assert_eq!(retry.state(), RetryTopology);
        assert_eq!(Outcome::<()>::RetryTopology.state(), RetryTopology);
        assert_eq!(Outcome::Completed(()).state(), Completed);
    }

    fn slow_cluster(delay_ms: u64, request_ms: u64, drain_ms: u64) -> (FakeCluster, OperationsFactory) {
        let cluster = FakeCluster::new(vec![vec![addr("a")]]);
        cluster.delay_responses(&addr("a"), Duration::from_millis(delay_ms));
        let config = ClientConfig {
            request_timeout_ms: request_ms,
            drain_timeout_ms: drain_ms,
            ..ClientConfig::default()
        };
        let factory = cluster.factory_with_config("books", config);
        (cluster, factory)
    }

    async fn wait_for_return(cluster: &FakeCluster) {
        for _ in 0..100 {
            if cluster.released_total() + cluster.discarded_total() == cluster.acquired_total() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_late_response_is_drained_and_channel_released() {
        let (cluster, factory) = slow_cluster(150, 30, 2000);
        let err = factory
            .new_get(&mut CallContext::new(), "k")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)), "{:?}", err);

        wait_for_return(&cluster).await;
        assert_eq!(cluster.released_total(), 1);
        assert_eq!(cluster.discarded_total(), 0);
        cluster.assert_all_channels_returned_once();
    }

    #[tokio::test]
    async fn test_drain_that_never_completes_discards() {
        let (cluster, factory) = slow_cluster(5000, 30, 50);
        let result = factory.new_get(&mut CallContext::new(), "k").execute().await;
        assert!(result.is_err());

        wait_for_return(&cluster).await;
        assert_eq!(cluster.discarded_total(), 1);
        assert_eq!(cluster.released_total(), 0);
        cluster.assert_all_channels_returned_once();
    }

    #[tokio::test]
    async fn test_dropped_call_discards_its_channel() {
        let (cluster, factory) = slow_cluster(5000, 60_000, 5000);
        let call = factory.new_get(&mut CallContext::new(), "k").execute();
        let dropped = tokio::time::timeout(Duration::from_millis(30), call).await;
        assert!(dropped.is_err());

        assert_eq!(cluster.acquired_total(), 1);
        assert_eq!(cluster.discarded_total(), 1);
        assert_eq!(cluster.released_total(), 0);
    }
}
