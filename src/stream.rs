use futures_util::StreamExt;

use crate::error::SkailarError;
use crate::http::HttpBodyStream;

/// Concatenates a streamed response body into one string.
///
/// Chunks are joined in delivery order and decoded as UTF-8 once the stream ends, so a
/// character split across two chunks is preserved. The body is consumed; an error from
/// any chunk aborts the aggregation and nothing collected so far is returned.
///
/// # Examples
///
/// ```
/// # use futures_util::stream;
/// # use skailar::error::SkailarError;
/// # use skailar::http::HttpBodyStream;
/// # use skailar::stream::collect_stream_text;
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let chunks: Vec<Result<Vec<u8>, SkailarError>> =
///     vec![Ok(b"a".to_vec()), Ok(b"b".to_vec()), Ok(b"c".to_vec())];
/// let body: HttpBodyStream = Box::pin(stream::iter(chunks));
/// assert_eq!(collect_stream_text(body).await.unwrap(), "abc");
/// # });
/// ```
///
/// # Errors
///
/// Propagates the first chunk error, or returns [`SkailarError::Decode`] when the joined
/// bytes are not valid UTF-8.
pub async fn collect_stream_text(mut body: HttpBodyStream) -> Result<String, SkailarError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    String::from_utf8(bytes).map_err(|err| SkailarError::Decode {
        message: format!("stream body is not valid UTF-8: {err}"),
    })
}
