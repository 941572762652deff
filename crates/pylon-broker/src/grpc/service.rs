//! The broker's `CloudEventService`: `Publish` and `Subscribe`.
//!
//! `Publish` is a one-shot unary call: the event is decoded and routed to
//! the repository (or to the resync coordinator for `resync_request`).
//! `Subscribe` registers a broadcaster subscriber that encodes each matched
//! resource and forwards it down the open stream; the registration is torn
//! down on the first send failure or when the client goes away.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::Stream;
use metrics::counter;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn, Instrument};

use pylon_core::observability::{publish_span, subscription_span, METRIC_EVENTS_SENT};
use pylon_proto::cloud_event_service_server::CloudEventService;
use pylon_proto::{CloudEvent as ProtoCloudEvent, PublishRequest, SubscriptionRequest};

use crate::broadcaster::{EventBroadcaster, SubscriberCallback};
use crate::codec;
use crate::error::{Error, Result};
use crate::event::{CloudEvent, EventAction, EventType, EXTENSION_RESOURCE_ID};
use crate::repository::ResourceRepository;
use crate::resource::Resource;
use crate::resync::ResyncCoordinator;

/// Subscription topic grammar: `sources/<source>/clusters/<consumer>/status`
/// where `<consumer>` is a lowercase-kebab id or the wildcard `+`.
pub const SUBSCRIPTION_TOPIC_PATTERN: &str =
    r"^sources/([a-z0-9-]+)/clusters/([a-z0-9-]+|\+)/status$";

/// Events buffered per subscriber stream before the forwarding task stalls.
const SUBSCRIBE_CHANNEL_CAPACITY: usize = 32;

fn topic_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(SUBSCRIPTION_TOPIC_PATTERN).expect("subscription topic pattern is valid")
    })
}

/// The broker's CloudEvents gRPC service.
pub struct GrpcBroker {
    repository: Arc<dyn ResourceRepository>,
    broadcaster: Arc<EventBroadcaster>,
    resync: Arc<ResyncCoordinator>,
}

impl GrpcBroker {
    /// Creates the service over its collaborators.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        broadcaster: Arc<EventBroadcaster>,
        resync: Arc<ResyncCoordinator>,
    ) -> Self {
        Self {
            repository,
            broadcaster,
            resync,
        }
    }

    async fn handle_publish(&self, event: CloudEvent) -> Result<()> {
        let event_type: EventType = event.event_type.parse()?;

        match event_type.action {
            EventAction::ResyncRequest => self.resync.respond_resync_request(&event).await,
            EventAction::CreateRequest => {
                let resource = codec::decode(event_type.data_type, &event)?;
                self.repository.create(resource).await?;
                Ok(())
            }
            EventAction::UpdateRequest => {
                let mut resource = codec::decode(event_type.data_type, &event)?;
                if resource.is_bundle() {
                    let stored = self.repository.get(&resource.id).await?;
                    codec::reconcile_update_version(&stored, &mut resource);
                }
                self.repository.update(resource).await?;
                Ok(())
            }
            EventAction::DeleteRequest => {
                // Deletion needs only the id; the payload is not consulted.
                let id = event.require_string_extension(EXTENSION_RESOURCE_ID)?;
                match self.repository.mark_as_deleting(&id).await {
                    // Already reconciled away; deletion is idempotent at
                    // this boundary.
                    Err(err) if err.is_not_found() => Ok(()),
                    other => other,
                }
            }
        }
    }
}

#[tonic::async_trait]
impl CloudEventService for GrpcBroker {
    type SubscribeStream = SubscriptionStream;

    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> std::result::Result<Response<()>, Status> {
        let event_pb = request
            .into_inner()
            .event
            .ok_or_else(|| Status::invalid_argument("publish request carries no event"))?;
        let event = CloudEvent::from_proto(event_pb).map_err(Status::from)?;

        // Everything the handler and coordinator log inherits the span.
        let span = publish_span(&event.event_type, &event.source);
        self.handle_publish(event)
            .instrument(span)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(()))
    }

    async fn subscribe(
        &self,
        request: Request<SubscriptionRequest>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let topic = request.into_inner().topic;
        let Some(captures) = topic_regex().captures(&topic) else {
            return Err(Status::from(Error::InvalidTopic {
                topic,
                pattern: SUBSCRIPTION_TOPIC_PATTERN,
            }));
        };
        let source = captures[1].to_string();
        let consumer = captures[2].to_string();

        let (stream_tx, stream_rx) =
            mpsc::channel::<std::result::Result<ProtoCloudEvent, Status>>(
                SUBSCRIBE_CHANNEL_CAPACITY,
            );

        let sender = stream_tx.clone();
        let callback: SubscriberCallback = Arc::new(move |resource: Resource| {
            let sender = sender.clone();
            async move {
                let event = codec::encode(&resource)?;
                let event_type = event.event_type.clone();
                let proto = event.into_proto()?;

                sender
                    .send(Ok(proto))
                    .await
                    .map_err(|_| Error::transport("subscriber stream closed"))?;

                counter!(
                    METRIC_EVENTS_SENT,
                    "source" => resource.source.clone(),
                    "cluster" => resource.consumer_id.clone(),
                    "type" => event_type
                )
                .increment(1);
                Ok(())
            }
            .boxed()
        });

        let (client_id, mut errors) = self.broadcaster.register(&source, &consumer, callback);
        let span = subscription_span(&client_id, &topic);
        span.in_scope(|| info!("subscriber registered"));

        // First callback error tears the registration down; the stream guard
        // below covers client cancellation and server shutdown.
        let broadcaster = Arc::clone(&self.broadcaster);
        let monitor_id = client_id.clone();
        tokio::spawn(
            async move {
                if let Some(err) = errors.recv().await {
                    warn!(error = %err, "subscriber send failed");
                    let _ = stream_tx.send(Err(Status::from(err))).await;
                    broadcaster.unregister(&monitor_id);
                }
            }
            .instrument(span),
        );

        Ok(Response::new(SubscriptionStream {
            inner: ReceiverStream::new(stream_rx),
            broadcaster: Arc::clone(&self.broadcaster),
            client_id,
        }))
    }
}

/// Server stream that unregisters its subscriber when dropped.
pub struct SubscriptionStream {
    inner: ReceiverStream<std::result::Result<ProtoCloudEvent, Status>>,
    broadcaster: Arc<EventBroadcaster>,
    client_id: String,
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Stream for SubscriptionStream {
    type Item = std::result::Result<ProtoCloudEvent, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.broadcaster.unregister(&self.client_id);
    }
}
