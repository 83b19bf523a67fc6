//! S3 object storage.
//!
//! Small blobs go up in a single `PutObject`; larger ones use multipart
//! upload so the final object only becomes visible once the upload
//! completes. A failed or cancelled multipart upload is aborted, and
//! `delete` also aborts any in-flight uploads for the key.

use super::Storage;
use crate::error::Error;
use crate::Result;
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 8 MiB parts; S3 requires parts of at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Storage {
    pub async fn new(bucket: String, prefix: Option<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);
        tracing::info!(bucket = %bucket, prefix = ?prefix, "S3 storage initialized");
        Self {
            client,
            bucket,
            prefix,
        }
    }

    fn key(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), name),
            None => name.to_string(),
        }
    }

    fn strip_prefix(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => key
                .strip_prefix(prefix.trim_end_matches('/'))
                .map(|rest| rest.trim_start_matches('/').to_string())
                .unwrap_or_else(|| key.to_string()),
            None => key.to_string(),
        }
    }

    /// Fill `buf` up to `PART_SIZE` bytes, returning how many were read.
    async fn fill_part(
        reader: &mut (dyn AsyncRead + Send + Unpin),
        buf: &mut Vec<u8>,
    ) -> Result<usize> {
        buf.clear();
        while buf.len() < PART_SIZE {
            let mut chunk = vec![0u8; (PART_SIZE - buf.len()).min(64 * 1024)];
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| Error::StorageUnavailable(format!("read source: {}", e)))?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf.len())
    }

    async fn put_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| unavailable("create multipart", key, &e))?;
        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| Error::StorageUnavailable(format!("{}: no upload id", key)))?
            .to_string();

        let result = self
            .upload_parts(key, &upload_id, first_part, reader)
            .await;
        if result.is_err() {
            // Leave nothing half-written behind.
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut completed = Vec::new();
        let mut part_number = 1i32;
        let mut part = first_part;

        loop {
            if part.is_empty() {
                break;
            }
            let upload = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(std::mem::take(&mut part)))
                .send()
                .await
                .map_err(|e| unavailable("upload part", key, &e))?;
            completed.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload.e_tag().unwrap_or(""))
                    .build(),
            );
            part_number += 1;

            part = Vec::with_capacity(PART_SIZE);
            Self::fill_part(reader, &mut part).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| unavailable("complete multipart", key, &e))?;
        Ok(())
    }
}

fn unavailable<E: std::error::Error>(what: &str, key: &str, e: &E) -> Error {
    Error::StorageUnavailable(format!("{} {}: {}", what, key, DisplayErrorContext(e)))
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let key = self.key(name);

        let mut first_part = Vec::with_capacity(PART_SIZE);
        let n = Self::fill_part(reader, &mut first_part).await?;

        if n < PART_SIZE {
            // Fits in a single request.
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(first_part))
                .send()
                .await
                .map_err(|e| unavailable("put", &key, &e))?;
        } else {
            self.put_multipart(&key, first_part, reader).await?;
        }

        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn get(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let key = self.key(name);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    Error::StorageNotFound(name.to_string())
                } else {
                    unavailable("get", &key, &e)
                }
            })?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::StorageUnavailable(format!("get {}: {}", key, e)))?
            .into_bytes();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.key(prefix);
        let mut names = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| unavailable("list", &full_prefix, &e))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    names.push(self.strip_prefix(key));
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| unavailable("delete", &key, &e))?;

        // Abort any multipart upload a cancelled put may have left behind.
        let uploads = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(&key)
            .send()
            .await
            .map_err(|e| unavailable("list multipart", &key, &e))?;
        for upload in uploads.uploads() {
            if let (Some(upload_key), Some(upload_id)) = (upload.key(), upload.upload_id()) {
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(upload_key)
                    .upload_id(upload_id)
                    .send()
                    .await;
            }
        }
        Ok(())
    }
}
