//! Local feed for `--memory` mode: newline-delimited payloads read from
//! stdin are published to the in-memory broker.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use devstream_middleware::memory::InMemoryTransport;

/// Publish every non-blank line of `reader` on `subject`, as-is. Returns the
/// number of lines published once the reader is exhausted.
pub async fn feed_lines<R>(
    reader: R,
    transport: &InMemoryTransport,
    subject: &str,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut published = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let sequence = transport.publish(subject, Bytes::from(line.to_string()));
        debug!(subject, sequence, "Published local payload");
        published += 1;
    }

    info!(subject, published, "Local feed finished");
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstream_middleware::{ConsumerConfig, Transport};

    #[tokio::test]
    async fn test_lines_are_published_in_order() {
        let transport = InMemoryTransport::new();
        let input: &[u8] = b"{\"Device_ID\": 1150}\n\n  \n{\"Device_ID\": 1151}\nnot json\n";

        let published = feed_lines(input, &transport, "device_stream_data")
            .await
            .unwrap();
        assert_eq!(published, 3);

        let consumer = ConsumerConfig {
            stream: "DEVICE_STREAM".to_string(),
            subject: "device_stream_data".to_string(),
            durable_name: "local".to_string(),
        };
        let mut sub = transport.subscribe(&consumer).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from(r#"{"Device_ID": 1150}"#));
        assert_eq!(first.sequence, Some(1));
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.payload, Bytes::from(r#"{"Device_ID": 1151}"#));
        // Undecodable lines still go out; the pipeline decides what to skip
        let third = sub.next().await.unwrap().unwrap();
        assert_eq!(third.payload, Bytes::from("not json"));
    }
}
