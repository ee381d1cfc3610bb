//! reqwest-based [`FileSystem`] client for the REST surface.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::oneshot;

use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::http::ErrorBody;
use crate::metadata::FileMetadata;
use crate::stream::{byte_channel, ByteSink, ByteSource, STREAM_CHANNEL_SIZE};

pub struct HttpFs {
    base: String,
    client: reqwest::Client,
}

fn transport(e: reqwest::Error) -> FsError {
    FsError::Io(std::io::Error::other(e))
}

impl HttpFs {
    /// Client for a server at `base_url` (e.g. `http://10.0.0.1:8080`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Turn a non-success response into the error its JSON body carries.
    async fn ensure_success(
        response: reqwest::Response,
        subject: &str,
    ) -> FsResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let code = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error_code)
            .unwrap_or(0);
        Err(FsError::from_code(code, subject))
    }

    async fn simple(&self, request: reqwest::RequestBuilder, subject: &str) -> FsResult<()> {
        let response = request.send().await.map_err(transport)?;
        Self::ensure_success(response, subject).await?;
        Ok(())
    }
}

#[async_trait]
impl FileSystem for HttpFs {
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink> {
        let mut request = self.client.post(self.url(&format!("/upload/{name}")));
        if let Some(size) = size {
            request = request.query(&[("size", size)]);
        }

        let (sink, source) = byte_channel(STREAM_CHANNEL_SIZE);
        // The body stream hands the source back once it is exhausted, so
        // the commit acknowledgement can wait for the response status.
        let (handoff_tx, handoff_rx) = oneshot::channel::<ByteSource>();
        let body = futures::stream::unfold(
            (source, Some(handoff_tx)),
            |(mut source, mut handoff)| async move {
                match source.pull().await {
                    Ok(Some(buf)) => Some((Ok::<Bytes, std::io::Error>(buf), (source, handoff))),
                    Ok(None) => {
                        if let Some(tx) = handoff.take() {
                            let _ = tx.send(source);
                        }
                        None
                    }
                    Err(e) => Some((Err(std::io::Error::other(e)), (source, handoff))),
                }
            },
        );

        let subject = name.to_string();
        tokio::spawn(async move {
            let outcome = match request.body(reqwest::Body::wrap_stream(body)).send().await {
                Ok(response) => Self::ensure_success(response, &subject).await.map(|_| ()),
                Err(e) => Err(transport(e)),
            };
            // The handoff fails when the body errored mid-stream; the
            // producer already holds that error.
            if let Ok(source) = handoff_rx.await {
                source.finish(outcome);
            }
        });
        Ok(sink)
    }

    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink> {
        let request = self
            .client
            .post(self.url(&format!("/append/{name}")))
            .query(&[("offset", offset)]);

        let (sink, source) = byte_channel(STREAM_CHANNEL_SIZE);
        let (handoff_tx, handoff_rx) = oneshot::channel::<ByteSource>();
        let body = futures::stream::unfold(
            (source, Some(handoff_tx)),
            |(mut source, mut handoff)| async move {
                match source.pull().await {
                    Ok(Some(buf)) => Some((Ok::<Bytes, std::io::Error>(buf), (source, handoff))),
                    Ok(None) => {
                        if let Some(tx) = handoff.take() {
                            let _ = tx.send(source);
                        }
                        None
                    }
                    Err(e) => Some((Err(std::io::Error::other(e)), (source, handoff))),
                }
            },
        );

        let subject = name.to_string();
        tokio::spawn(async move {
            let outcome = match request.body(reqwest::Body::wrap_stream(body)).send().await {
                Ok(response) => Self::ensure_success(response, &subject).await.map(|_| ()),
                Err(e) => Err(transport(e)),
            };
            if let Ok(source) = handoff_rx.await {
                source.finish(outcome);
            }
        });
        Ok(sink)
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource> {
        let response = self
            .client
            .get(self.url(&format!("/download/{name}")))
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await
            .map_err(transport)?;
        let response = Self::ensure_success(response, name).await?;

        let (mut sink, source) = byte_channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(buf) => {
                        if sink.push(buf).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        sink.abort(transport(e)).await;
                        return;
                    }
                }
            }
            let _ = sink.finish().await;
        });
        Ok(source)
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        let request = self.client.delete(self.url(&format!("/delete/{name}")));
        self.simple(request, name).await
    }

    async fn delete_all(&self, names: &[String]) -> FsResult<()> {
        let request = self.client.post(self.url("/deleteAll")).json(&names);
        self.simple(request, "").await
    }

    async fn copy(&self, src: &str, dst: &str) -> FsResult<()> {
        let request = self
            .client
            .post(self.url("/copy"))
            .query(&[("name", src), ("target", dst)]);
        self.simple(request, src).await
    }

    async fn copy_all(&self, pairs: &HashMap<String, String>) -> FsResult<()> {
        let request = self.client.post(self.url("/copyAll")).json(&pairs);
        self.simple(request, "").await
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let request = self
            .client
            .post(self.url("/move"))
            .query(&[("name", src), ("target", dst)]);
        self.simple(request, src).await
    }

    async fn rename_all(&self, pairs: &HashMap<String, String>) -> FsResult<()> {
        let request = self.client.post(self.url("/moveAll")).json(&pairs);
        self.simple(request, "").await
    }

    async fn list(&self, pattern: &str) -> FsResult<HashMap<String, FileMetadata>> {
        let response = self
            .client
            .get(self.url("/list"))
            .query(&[("glob", pattern)])
            .send()
            .await
            .map_err(transport)?;
        let response = Self::ensure_success(response, pattern).await?;
        response.json().await.map_err(transport)
    }

    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        let response = self
            .client
            .get(self.url(&format!("/info/{name}")))
            .send()
            .await
            .map_err(transport)?;
        let response = Self::ensure_success(response, name).await?;
        response.json().await.map_err(transport)
    }

    async fn info_all(&self, names: &[String]) -> FsResult<HashMap<String, FileMetadata>> {
        let response = self
            .client
            .post(self.url("/infoAll"))
            .json(&names)
            .send()
            .await
            .map_err(transport)?;
        let response = Self::ensure_success(response, "").await?;
        response.json().await.map_err(transport)
    }

    async fn ping(&self) -> FsResult<()> {
        let request = self.client.get(self.url("/ping"));
        self.simple(request, "").await
    }
}
