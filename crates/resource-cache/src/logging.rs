use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::registry::LookupSpan;

/// A layer writing one JSON object per event to `make_writer`.
///
/// The fields of the event are flattened into the object, next to the spans it was emitted in,
/// so fetches can be correlated by their cache key. Filtering and forwarding to Sentry are up
/// to the subscriber this layer is added to.
pub fn json_layer<S, W>(make_writer: W) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(make_writer)
}
