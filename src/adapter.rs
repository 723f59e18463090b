//! DVB adapters: a set of frontends plus one demux/DVR pair.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::demux::Demux;
use crate::frontend::Frontend;

/// One hardware adapter. Identity is `(num, id)` where `id` is the
/// hardware name reported by its first frontend.
pub struct Adapter {
    pub num: u32,
    pub id: String,
    frontends: Vec<Arc<Mutex<Frontend>>>,
    demux: Arc<Mutex<Demux>>,
}

impl Adapter {
    pub fn new(num: u32, id: impl Into<String>, frontends: Vec<Frontend>, demux: Demux) -> Self {
        Adapter {
            num,
            id: id.into(),
            frontends: frontends
                .into_iter()
                .map(|f| Arc::new(Mutex::new(f)))
                .collect(),
            demux: Arc::new(Mutex::new(demux)),
        }
    }

    pub fn frontends(&self) -> &[Arc<Mutex<Frontend>>] {
        &self.frontends
    }

    pub fn demux(&self) -> &Arc<Mutex<Demux>> {
        &self.demux
    }

    /// Probes `/dev/dvb/adapter0..max`, building an adapter per populated
    /// device directory. Probe failures skip the adapter.
    #[cfg(target_os = "linux")]
    pub fn detect_all(max_adapters: u32) -> Vec<Adapter> {
        use log::warn;

        let mut adapters = Vec::new();
        for num in 0..max_adapters {
            match crate::hw::linux::probe_adapter(num) {
                Ok(Some((id, frontends, demux))) => {
                    let frontends = frontends
                        .into_iter()
                        .enumerate()
                        .map(|(m, io)| {
                            Frontend::new(format!("adapter{num}/frontend{m}"), Box::new(io))
                        })
                        .collect();
                    adapters.push(Adapter::new(num, id, frontends, Demux::new(Box::new(demux))));
                }
                Ok(None) => break,
                Err(e) => warn!("adapter{num}: probe failed: {e}"),
            }
        }
        adapters
    }
}
