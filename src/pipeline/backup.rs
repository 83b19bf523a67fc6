//! Backup orchestration.
//!
//! State machine: Validated → SchemaExtracting → (Compressing?) →
//! (Encrypting?) → Storing → Manifesting → Done, with any state able to
//! fail. Compression always precedes encryption, and the manifest is only
//! written once every output it references is durable.

use crate::compress::{self, ArchiveMember};
use crate::config::{CompressionType, Settings};
use crate::envelope;
use crate::error::Error;
use crate::integrity::{self, sha256_hex};
use crate::keys::{self, KeyProvider, PROVIDER_BACKOFF_CAP, PROVIDER_RETRIES};
use crate::manifest::{
    ArtifactEntry, IntegrityEntry, Manifest, OutputEntry, Transform, MANIFEST_NAME,
};
use crate::pipeline::{chunk_reader, spawn_heartbeat, with_retries};
use crate::schema::mysql::MySqlAdapter;
use crate::schema::SchemaAdapter;
use crate::storage::{self, Storage, STORAGE_BACKOFF_CAP, STORAGE_RETRIES};
use crate::{Result, Secrets};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
pub struct BackupOutcome {
    pub backup_id: Uuid,
    /// Storage prefix all outputs live under.
    pub prefix: String,
    pub locations: Vec<String>,
    pub artifacts: usize,
    pub outputs: usize,
}

struct RawArtifact {
    name: String,
    data: Vec<u8>,
}

pub async fn run_backup(
    settings: &Settings,
    secrets: &Secrets,
    cancel: &CancellationToken,
) -> Result<BackupOutcome> {
    settings.validate_backup(secrets)?;
    let backup_id = Uuid::new_v4();
    tracing::info!(state = "Validated", %backup_id, db = %settings.database.db_name, "backup job validated");

    let store = storage::build_storage(settings.storage.storage_type, secrets).await?;

    let provider = if settings.security.encryption {
        Some(keys::build_provider(
            &settings.security,
            secrets,
            settings.kms_timeout(),
        )?)
    } else {
        None
    };

    // Extraction: one connection, categories in emission-rank order.
    tracing::info!(state = "SchemaExtracting");
    let mut adapter = Box::new(
        MySqlAdapter::connect(&settings.database, &secrets.db_password).await?,
    );
    let engine = adapter.engine().await?;

    let heartbeat = spawn_heartbeat(
        "schema extraction",
        Duration::from_secs(settings.limits.heartbeat_secs),
    );
    let extraction = extract_artifacts(settings, adapter.as_mut(), cancel).await;
    heartbeat.cancel();
    let dumps = extraction?;
    adapter.close().await?;

    let artifacts = stage_artifacts(settings, dumps);
    let artifact_entries: Vec<ArtifactEntry> = artifacts
        .iter()
        .map(|a| ArtifactEntry {
            name: a.name.clone(),
            sha256: sha256_hex(&a.data),
            size: a.data.len() as u64,
        })
        .collect();

    let compression = settings
        .compression
        .compression
        .then(|| {
            settings
                .compression
                .compression_type
                .unwrap_or(CompressionType::Zip)
        });
    let transforms = plan_transforms(compression, provider.as_ref().map(|p| p.name().to_string()));

    // Transform chain: compress first, then encrypt.
    let mut staged: Vec<(String, Vec<u8>)> = match compression {
        Some(kind) => {
            tracing::info!(state = "Compressing", kind = kind.as_str());
            let members: Vec<ArchiveMember> = artifacts
                .into_iter()
                .map(|a| ArchiveMember {
                    name: a.name,
                    data: a.data,
                })
                .collect();
            let archive = tokio::task::spawn_blocking(move || compress::compress(kind, &members))
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("compression task: {}", e)))??;
            vec![("dump.backy".to_string(), archive)]
        }
        None => artifacts
            .into_iter()
            .map(|a| (a.name, a.data))
            .collect(),
    };

    if let Some(provider) = &provider {
        tracing::info!(state = "Encrypting", provider = provider.name());
        let mut sealed = Vec::with_capacity(staged.len());
        for (name, data) in staged {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let blob = seal_artifact(&data, provider.as_ref(), settings.kms_timeout()).await?;
            let name = if compression.is_some() {
                name
            } else {
                encrypted_name(&name)
            };
            sealed.push((name, blob));
        }
        staged = sealed;
    }

    let outputs: Vec<(String, Bytes)> = staged
        .into_iter()
        .map(|(name, data)| (name, Bytes::from(data)))
        .collect();

    // Store with bounded fan-out; on any failure remove whatever made it up.
    tracing::info!(state = "Storing", outputs = outputs.len());
    let prefix = format!(
        "{}_{}",
        settings.database.db_name,
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let stored = store_outputs(
        store.clone(),
        &prefix,
        &outputs,
        settings.limits.fan_out,
        settings.storage_timeout(),
        cancel,
    )
    .await;

    let (output_entries, locations) = match stored {
        Ok(stored) => stored,
        Err(e) => {
            cleanup_outputs(store.as_ref(), &prefix, &outputs).await;
            return Err(e);
        }
    };

    // Manifest last, after all referenced outputs are durable.
    tracing::info!(state = "Manifesting");
    let mut manifest = Manifest {
        backup_id,
        created_at: Utc::now(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        engine,
        features: settings.database.features,
        multiple_files: settings.database.multiple_files,
        transforms,
        artifacts: artifact_entries,
        outputs: output_entries,
        integrity: settings
            .integrity
            .integrity_check
            .then(|| IntegrityEntry {
                kind: settings
                    .integrity
                    .integrity_type
                    .unwrap_or(crate::config::IntegrityType::Checksum),
                value: String::new(),
            }),
    };
    if manifest.integrity.is_some() {
        let secret = secrets.integrity_password.as_deref().map(str::as_bytes);
        let tag = integrity::compute_tag(&manifest, &outputs, secret)?;
        if let Some(entry) = &mut manifest.integrity {
            entry.value = tag;
        }
    }

    let manifest_json = manifest.canonical_json()?;
    let manifest_name = format!("{}/{}", prefix, MANIFEST_NAME);
    let manifest_result = with_retries(
        "store manifest",
        STORAGE_RETRIES,
        STORAGE_BACKOFF_CAP,
        || async {
            let mut reader = chunk_reader(Bytes::from(manifest_json.clone().into_bytes()));
            store.put(&manifest_name, &mut reader).await
        },
    )
    .await;
    if let Err(e) = manifest_result {
        cleanup_outputs(store.as_ref(), &prefix, &outputs).await;
        return Err(e);
    }

    tracing::info!(state = "Done", %backup_id, prefix = %prefix, "backup complete");
    Ok(BackupOutcome {
        backup_id,
        prefix,
        locations,
        artifacts: manifest.artifacts.len(),
        outputs: manifest.outputs.len(),
    })
}

/// Dump every enabled category, checking for cancellation between
/// categories.
async fn extract_artifacts(
    settings: &Settings,
    adapter: &mut MySqlAdapter,
    cancel: &CancellationToken,
) -> Result<Vec<(crate::schema::ObjectCategory, String)>> {
    let mut dumps = Vec::new();
    for category in settings.database.features.enabled() {
        let dump = tokio::select! {
            result = adapter.dump_category(category) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        if let Some(text) = dump {
            dumps.push((category, text));
        }
    }
    Ok(dumps)
}

/// Turn category dumps into named artifacts: one per category, or a single
/// concatenated dump whose internal order is the emission rank.
fn stage_artifacts(
    settings: &Settings,
    dumps: Vec<(crate::schema::ObjectCategory, String)>,
) -> Vec<RawArtifact> {
    if settings.database.multiple_files {
        dumps
            .into_iter()
            .map(|(category, text)| RawArtifact {
                name: category.member_name(),
                data: text.into_bytes(),
            })
            .collect()
    } else {
        let combined = dumps
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join("\n\n");
        vec![RawArtifact {
            name: "dump.sql".to_string(),
            data: combined.into_bytes(),
        }]
    }
}

async fn seal_artifact(
    data: &[u8],
    provider: &dyn KeyProvider,
    kms_timeout: Duration,
) -> Result<Vec<u8>> {
    // Only the provider round-trip is retried; the AEAD pass is local.
    let (data_key, wrapped) = with_retries(
        "generate data key",
        PROVIDER_RETRIES,
        PROVIDER_BACKOFF_CAP,
        || async {
            match tokio::time::timeout(kms_timeout, provider.generate_data_key()).await {
                Ok(result) => result,
                Err(_) => Err(Error::ProviderUnavailable(
                    "data key generation timed out".into(),
                )),
            }
        },
    )
    .await?;
    envelope::seal_with(&data_key, &wrapped, data)
}

async fn store_outputs(
    store: Arc<dyn Storage>,
    prefix: &str,
    outputs: &[(String, Bytes)],
    fan_out: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(Vec<OutputEntry>, Vec<String>)> {
    let semaphore = Arc::new(Semaphore::new(fan_out.max(1)));
    let mut handles = Vec::with_capacity(outputs.len());

    for (idx, (name, data)) in outputs.iter().enumerate() {
        let store = store.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let name = name.clone();
        let data = data.clone();
        let full_name = format!("{}/{}", prefix, name);

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("semaphore closed: {}", e)))?;

            let entry = OutputEntry {
                name,
                sha256: sha256_hex(&data),
                size: data.len() as u64,
            };

            let location = with_retries(
                "store output",
                STORAGE_RETRIES,
                STORAGE_BACKOFF_CAP,
                || async {
                    let mut reader = chunk_reader(data.clone());
                    tokio::select! {
                        result = tokio::time::timeout(timeout, store.put(&full_name, &mut reader)) => {
                            match result {
                                Ok(inner) => inner,
                                Err(_) => Err(Error::StorageUnavailable(format!(
                                    "put {} timed out",
                                    full_name
                                ))),
                            }
                        }
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                    }
                },
            )
            .await?;

            tracing::info!(output = %entry.name, size = entry.size, location = %location, "output stored");
            Ok::<_, Error>((idx, entry, location))
        }));
    }

    let mut slots: Vec<Option<(OutputEntry, String)>> = Vec::new();
    slots.resize_with(outputs.len(), || None);
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok((idx, entry, location))) => slots[idx] = Some((entry, location)),
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(Error::Internal(anyhow::anyhow!("store task: {}", e)));
                }
            }
        }
    }

    if let Some(e) = first_error {
        // Cancellation wins over secondary failures for reporting.
        return Err(if cancel.is_cancelled() { Error::Cancelled } else { e });
    }

    let mut entries = Vec::with_capacity(slots.len());
    let mut locations = Vec::with_capacity(slots.len());
    for slot in slots {
        let (entry, location) = slot.ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("output task finished without a result"))
        })?;
        entries.push(entry);
        locations.push(location);
    }
    Ok((entries, locations))
}

/// Remove every output this job may have written, including partial state.
async fn cleanup_outputs(store: &dyn Storage, prefix: &str, outputs: &[(String, Bytes)]) {
    for (name, _) in outputs {
        let full_name = format!("{}/{}", prefix, name);
        if let Err(e) = store.delete(&full_name).await {
            tracing::warn!(output = %full_name, error = %e, "cleanup failed");
        }
    }
    let manifest_name = format!("{}/{}", prefix, MANIFEST_NAME);
    let _ = store.delete(&manifest_name).await;
}

fn plan_transforms(
    compression: Option<CompressionType>,
    key_provider: Option<String>,
) -> Vec<Transform> {
    let mut transforms = Vec::new();
    if let Some(kind) = compression {
        transforms.push(Transform::Compress { kind });
    }
    if let Some(key_provider) = key_provider {
        transforms.push(Transform::Encrypt {
            alg_id: envelope::ALG_AES256_GCM_RSA_OAEP,
            key_provider,
        });
    }
    transforms
}

fn encrypted_name(name: &str) -> String {
    match name.strip_suffix(".sql") {
        Some(stem) => format!("{}.backy", stem),
        None => format!("{}.backy", name),
    }
}
