// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference persistence handler: appends every dispatched entry to a
//! `.ckmon` stream on disk, optionally gzip-compressed.

use crate::config::HandlerConfig;
use crate::handler::{Handler, SinkMonitor};
use async_trait::async_trait;
use ckmon_format::{LogEntry, LogWriter};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryFileConfig {
    /// Target file. The parent directory is created on activation.
    pub path: PathBuf,
    /// Compress the whole stream with gzip.
    #[serde(default)]
    pub use_gzip: bool,
}

impl HandlerConfig for BinaryFileConfig {
    fn type_name(&self) -> &'static str {
        "BinaryFile"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum Output {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Plain(w) => w.write(buf),
            Output::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Plain(w) => w.flush(),
            Output::Gzip(w) => w.flush(),
        }
    }
}

impl Output {
    fn finish(self) -> io::Result<()> {
        match self {
            Output::Plain(mut w) => w.flush(),
            Output::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()),
        }
    }
}

pub struct BinaryFileHandler {
    config: BinaryFileConfig,
    writer: Option<LogWriter<Output>>,
}

impl BinaryFileHandler {
    pub fn new(config: BinaryFileConfig) -> Self {
        Self {
            config,
            writer: None,
        }
    }

    fn open(&self) -> anyhow::Result<LogWriter<Output>> {
        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = BufWriter::new(File::create(&self.config.path)?);
        let output = if self.config.use_gzip {
            Output::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Output::Plain(file)
        };
        Ok(LogWriter::new(output)?)
    }
}

#[async_trait]
impl Handler for BinaryFileHandler {
    async fn activate(&mut self, _monitor: &SinkMonitor) -> bool {
        match self.open() {
            Ok(writer) => {
                self.writer = Some(writer);
                true
            }
            Err(e) => {
                error!(path = %self.config.path.display(), error = %e, "could not open stream file");
                false
            }
        }
    }

    async fn handle(&mut self, _monitor: &SinkMonitor, entry: &LogEntry) -> anyhow::Result<()> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_entry(entry)?;
                Ok(())
            }
            None => anyhow::bail!("stream file is not open"),
        }
    }

    async fn on_timer(&mut self, _monitor: &SinkMonitor, _span: std::time::Duration) {
        if let Some(writer) = &mut self.writer {
            if let Err(e) = writer.flush() {
                warn!(path = %self.config.path.display(), error = %e, "flush failed");
            }
        }
    }

    async fn apply_configuration(
        &mut self,
        _monitor: &SinkMonitor,
        config: &Arc<dyn HandlerConfig>,
    ) -> bool {
        match config.as_any().downcast_ref::<BinaryFileConfig>() {
            // Same target, same framing: nothing to do. A new path or a
            // compression change needs a fresh stream.
            Some(new_config) if *new_config == self.config => true,
            _ => false,
        }
    }

    async fn deactivate(&mut self, _monitor: &SinkMonitor) {
        if let Some(writer) = self.writer.take() {
            let closed = writer
                .close()
                .and_then(|output| output.finish().map_err(Into::into));
            if let Err(e) = closed {
                error!(path = %self.config.path.display(), error = %e, "could not close stream file");
            }
        }
    }
}
