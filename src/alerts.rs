//! Alert log
//!
//! A small JSON-file-backed list of camera alerts. Every mutation rewrites
//! the whole file through a temporary file and a rename, so a crash never
//! leaves a half-written log behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AlertError;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

/// One logged alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub message: String,
    #[serde(default)]
    pub level: AlertLevel,
    /// Camera or subsystem that raised the alert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Request body for creating an alert
#[derive(Debug, Clone, Deserialize)]
pub struct NewAlert {
    pub message: String,
    #[serde(default)]
    pub level: AlertLevel,
    #[serde(default)]
    pub source: Option<String>,
}

/// Persistent alert list
pub struct AlertStore {
    path: PathBuf,
    /// Held across the file write so saves are applied in order
    alerts: Mutex<Vec<Alert>>,
}

impl AlertStore {
    /// Open the log at `path`. A missing file is an empty log.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AlertError> {
        let path = path.into();
        let alerts = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(AlertError::Persistence(format!("{}: {}", path.display(), e)));
            }
        };

        tracing::debug!(path = %path.display(), count = alerts.len(), "Alert log opened");
        Ok(Self {
            path,
            alerts: Mutex::new(alerts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All alerts, newest first
    pub async fn list(&self) -> Vec<Alert> {
        let alerts = self.alerts.lock().await;
        let mut list = alerts.clone();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn get(&self, id: Uuid) -> Result<Alert, AlertError> {
        self.alerts
            .lock()
            .await
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(AlertError::NotFound(id))
    }

    pub async fn create(&self, new: NewAlert) -> Result<Alert, AlertError> {
        let alert = Alert {
            id: Uuid::new_v4(),
            message: new.message,
            level: new.level,
            source: new.source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        };

        let mut alerts = self.alerts.lock().await;
        alerts.push(alert.clone());
        if let Err(e) = self.save(&alerts).await {
            alerts.pop();
            return Err(e);
        }

        tracing::info!(alert = %alert.id, level = ?alert.level, "Alert recorded");
        Ok(alert)
    }

    /// Mark an alert as seen. Acknowledging twice keeps the first timestamp.
    pub async fn acknowledge(&self, id: Uuid) -> Result<Alert, AlertError> {
        let mut alerts = self.alerts.lock().await;
        let index = alerts
            .iter()
            .position(|a| a.id == id)
            .ok_or(AlertError::NotFound(id))?;

        if alerts[index].acknowledged {
            return Ok(alerts[index].clone());
        }

        let previous = alerts[index].clone();
        alerts[index].acknowledged = true;
        alerts[index].acknowledged_at = Some(Utc::now());
        if let Err(e) = self.save(&alerts).await {
            alerts[index] = previous;
            return Err(e);
        }
        Ok(alerts[index].clone())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), AlertError> {
        let mut alerts = self.alerts.lock().await;
        let index = alerts
            .iter()
            .position(|a| a.id == id)
            .ok_or(AlertError::NotFound(id))?;

        let removed = alerts.remove(index);
        if let Err(e) = self.save(&alerts).await {
            alerts.insert(index, removed);
            return Err(e);
        }
        Ok(())
    }

    async fn save(&self, alerts: &[Alert]) -> Result<(), AlertError> {
        let json = serde_json::to_vec_pretty(alerts)?;
        let tmp = self.path.with_extension("json.tmp");

        let persist =
            |e: std::io::Error| AlertError::Persistence(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(persist)?;
        }
        tokio::fs::write(&tmp, &json).await.map_err(persist)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(persist)?;
        Ok(())
    }
}
