//! Thermal Logger
//!
//! Periodic flush of the sample register to the output sink, one line per
//! cycle with a stamped sample. When the register goes quiet for too long
//! the logger provokes every ready device with a characteristic read,
//! which makes the firmware emit a fresh notification.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{info, warn};
use time::OffsetDateTime;

use crate::api::bus::BusApi;
use crate::core::constants::MAXTEMP;
use crate::core::events::ObjectPath;
use crate::model::device::DeviceRecord;
use crate::model::register::SampleRegister;

pub struct ThermalLog {
    sink: Box<dyn Write + Send>,
    last_stamp: Instant,
    stall_timeout: Duration,
}

impl ThermalLog {
    /// Opens (and truncates) the output file.
    pub fn create(path: &Path, stall_timeout: Duration) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::with_sink(
            Box::new(BufWriter::new(file)),
            stall_timeout,
        ))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>, stall_timeout: Duration) -> Self {
        Self {
            sink,
            last_stamp: Instant::now(),
            stall_timeout,
        }
    }

    /// One logger cycle: stall recovery first, then emission if anything
    /// was stamped since the previous cycle.
    pub async fn tick<B: BusApi>(
        &mut self,
        register: &mut SampleRegister,
        devices: &HashMap<ObjectPath, DeviceRecord>,
        bus: &B,
    ) -> Result<()> {
        if !register.stamped() && self.last_stamp.elapsed() > self.stall_timeout {
            self.unstall(devices, bus).await;
        }
        if register.stamped() {
            let values = register.advance_cycle();
            self.last_stamp = Instant::now();
            self.emit(&values)?;
        }
        Ok(())
    }

    /// Forces a read on the temperature characteristic of every device
    /// whose service is bound, recording the attempt time so the probe is
    /// not repeated every second.
    async fn unstall<B: BusApi>(&mut self, devices: &HashMap<ObjectPath, DeviceRecord>, bus: &B) {
        for record in devices.values() {
            if !record.service_ready {
                continue;
            }
            let Some(temperature) = &record.temperature else {
                continue;
            };
            info!("logger stalled, provoking {}", record.path);
            if let Err(e) = bus.read_value(temperature).await {
                warn!("stall read on {} failed: {}", record.path, e);
            }
            self.last_stamp = Instant::now();
        }
    }

    fn emit(&mut self, values: &[f64]) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let seconds = now.unix_timestamp_nanos() as f64 / 1e9;
        write!(self.sink, "{:6.2}  ", seconds)?;
        for &value in values {
            let shown = if value < MAXTEMP { value } else { f64::NAN };
            write!(self.sink, "{:6.1} ", shown)?;
        }
        writeln!(self.sink, "  [°C] ")?;
        self.sink.flush()?;
        Ok(())
    }
}
