//! The scanned service catalog and its XML persistence.
//!
//! Transponders and services live in arenas addressed by integer handles;
//! the name map preserves scan order, which doubles as the preference
//! order when a consumer asks for a service by name.

use std::collections::HashMap;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{DvbError, Result};
use crate::model::service::{ElementaryStream, RunningStatus, Service, ServiceType};
use crate::model::transponder::{
    Bandwidth, DeliverySystem, FecRate, Modulation, Polarization, Transponder, TuningParams,
};

/// Handle into the transponder arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransponderId(pub usize);

/// Handle into the service arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub usize);

/// A transponder with the adapter/frontend it was scanned on and the
/// services it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TransponderEntry {
    pub adapter: String,
    pub frontend: u32,
    pub transponder: Transponder,
    pub services: Vec<ServiceId>,
}

/// Mapping from service name to the transponders known to carry it.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Catalog {
    transponders: Vec<TransponderEntry>,
    services: Vec<Service>,
    by_name: HashMap<String, Vec<TransponderId>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transponder scanned on `adapter`/`frontend`, returning the
    /// existing handle if an identical carrier is already present.
    pub fn insert_transponder(
        &mut self,
        adapter: &str,
        frontend: u32,
        transponder: Transponder,
    ) -> TransponderId {
        if let Some(i) = self
            .transponders
            .iter()
            .position(|e| e.transponder == transponder)
        {
            return TransponderId(i);
        }
        self.transponders.push(TransponderEntry {
            adapter: adapter.to_string(),
            frontend,
            transponder,
            services: Vec::new(),
        });
        TransponderId(self.transponders.len() - 1)
    }

    /// Attaches a service to a transponder and registers its name. The
    /// transponder is appended to the name's preference list iff it is not
    /// already present.
    pub fn add_service(&mut self, tid: TransponderId, service: Service) -> ServiceId {
        let name = service.name.clone();
        self.services.push(service);
        let sid = ServiceId(self.services.len() - 1);
        self.transponders[tid.0].services.push(sid);

        let list = self.by_name.entry(name).or_default();
        if !list.contains(&tid) {
            list.push(tid);
        }
        sid
    }

    pub fn transponder(&self, id: TransponderId) -> &TransponderEntry {
        &self.transponders[id.0]
    }

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    /// Transponders carrying `name`, in scan (preference) order.
    pub fn transponders_for(&self, name: &str) -> &[TransponderId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first_transponder(&self, name: &str) -> Option<TransponderId> {
        self.transponders_for(name).first().copied()
    }

    /// The service named `name` on a given transponder.
    pub fn service_on(&self, tid: TransponderId, name: &str) -> Option<(ServiceId, &Service)> {
        self.transponders[tid.0]
            .services
            .iter()
            .map(|&sid| (sid, &self.services[sid.0]))
            .find(|(_, s)| s.name == name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn transponder_count(&self) -> usize {
        self.transponders.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Serializes to the `<dvbdevice>` document.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("dvbdevice")))?;

        // Group transponders by adapter, then frontend, preserving order.
        let mut adapters: Vec<&str> = Vec::new();
        for e in &self.transponders {
            if !adapters.contains(&e.adapter.as_str()) {
                adapters.push(&e.adapter);
            }
        }
        for adapter in adapters {
            let mut a = BytesStart::new("adapter");
            a.push_attribute(("id", adapter));
            writer.write_event(Event::Start(a))?;

            let mut frontends: Vec<(u32, DeliverySystem)> = Vec::new();
            for e in self.transponders.iter().filter(|e| e.adapter == adapter) {
                let key = (e.frontend, e.transponder.system());
                if !frontends.contains(&key) {
                    frontends.push(key);
                }
            }
            for (frontend, system) in frontends {
                let mut f = BytesStart::new("frontend");
                f.push_attribute(("type", system.as_str()));
                f.push_attribute(("num", frontend.to_string().as_str()));
                writer.write_event(Event::Start(f))?;

                for entry in self.transponders.iter().filter(|e| {
                    e.adapter == adapter
                        && e.frontend == frontend
                        && e.transponder.system() == system
                }) {
                    self.write_transponder(&mut writer, entry)?;
                }
                writer.write_event(Event::End(BytesEnd::new("frontend")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("adapter")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("dvbdevice")))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| DvbError::CatalogParse(e.to_string()))
    }

    fn write_transponder(
        &self,
        writer: &mut Writer<Vec<u8>>,
        entry: &TransponderEntry,
    ) -> Result<()> {
        let mut t = BytesStart::new("transponder");
        let frequency = entry.transponder.frequency().to_string();
        t.push_attribute(("frequency", frequency.as_str()));
        match entry.transponder.params() {
            TuningParams::Terrestrial {
                bandwidth,
                modulation,
                code_rate_hp,
                code_rate_lp,
                ..
            } => {
                t.push_attribute(("bandwidth", bandwidth.as_str()));
                t.push_attribute(("modulation", modulation.as_str()));
                t.push_attribute(("fec", code_rate_hp.as_str()));
                t.push_attribute(("feclp", code_rate_lp.as_str()));
            }
            TuningParams::Satellite {
                polarization,
                symbol_rate,
                fec,
                orbital,
                ..
            } => {
                t.push_attribute(("symbolrate", symbol_rate.to_string().as_str()));
                t.push_attribute(("fec", fec.as_str()));
                t.push_attribute(("polarization", polarization.as_str()));
                if let Some(orbital) = orbital {
                    t.push_attribute(("orbital", orbital.as_str()));
                }
            }
            TuningParams::Cable {
                symbol_rate,
                modulation,
                fec,
                ..
            } => {
                t.push_attribute(("symbolrate", symbol_rate.to_string().as_str()));
                t.push_attribute(("modulation", modulation.as_str()));
                t.push_attribute(("fec", fec.as_str()));
            }
        }
        writer.write_event(Event::Start(t))?;

        for &sid in &entry.services {
            let service = &self.services[sid.0];
            let mut s = BytesStart::new("service");
            s.push_attribute(("sid", service.sid.to_string().as_str()));
            s.push_attribute(("pmtpid", service.pmt_pid.to_string().as_str()));
            s.push_attribute(("pcrpid", service.pcr_pid.to_string().as_str()));
            s.push_attribute(("name", service.name.as_str()));
            s.push_attribute(("provider", service.provider.as_str()));
            s.push_attribute(("type", service.service_type.persistent().as_str()));
            s.push_attribute(("status", service.status.as_str()));
            s.push_attribute(("scrambled", if service.scrambled { "1" } else { "0" }));
            writer.write_event(Event::Start(s))?;

            for stream in service.streams() {
                let mut st = BytesStart::new("stream");
                st.push_attribute(("pid", stream.pid.to_string().as_str()));
                st.push_attribute(("type", stream.stream_type.to_string().as_str()));
                if let Some(lang) = &stream.language {
                    st.push_attribute(("lang", lang.as_str()));
                }
                writer.write_event(Event::Empty(st))?;
            }
            writer.write_event(Event::End(BytesEnd::new("service")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("transponder")))?;
        Ok(())
    }

    /// Parses a `<dvbdevice>` document. Errors here abort startup.
    pub fn from_xml(xml: &str) -> Result<Catalog> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut catalog = Catalog::new();
        let mut adapter = String::new();
        let mut frontend: u32 = 0;
        let mut system: Option<DeliverySystem> = None;
        let mut current_transponder: Option<TransponderId> = None;
        let mut current_service: Option<Service> = None;

        loop {
            let (e, self_closing) = match reader.read_event()? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(e) => {
                    if e.name().as_ref() == b"service" {
                        let service = current_service.take().ok_or_else(|| {
                            DvbError::CatalogParse("unbalanced service element".into())
                        })?;
                        let tid = current_transponder.ok_or_else(|| {
                            DvbError::CatalogParse("service outside transponder".into())
                        })?;
                        catalog.add_service(tid, service);
                    }
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };
            let attrs = collect_attributes(&e)?;
            match e.name().as_ref() {
                b"dvbdevice" => {}
                b"adapter" => {
                    adapter = required(&attrs, "id")?.to_string();
                }
                b"frontend" => {
                    system = Some(
                        DeliverySystem::from_str(required(&attrs, "type")?).ok_or_else(
                            || DvbError::CatalogParse("bad frontend type".into()),
                        )?,
                    );
                    frontend = parse_num(&attrs, "num")? as u32;
                }
                b"transponder" => {
                    let system = system.ok_or_else(|| {
                        DvbError::CatalogParse("transponder outside frontend".into())
                    })?;
                    let params = parse_tuning(system, &attrs)?;
                    current_transponder = Some(catalog.insert_transponder(
                        &adapter,
                        frontend,
                        Transponder::new(params),
                    ));
                }
                b"service" => {
                    let mut service = Service::new(
                        required(&attrs, "name")?,
                        parse_num(&attrs, "sid")? as u16,
                        parse_num(&attrs, "pmtpid")? as u16,
                    );
                    service.provider =
                        attrs.get("provider").cloned().unwrap_or_default();
                    service.set_pcr_pid(parse_num(&attrs, "pcrpid")? as u16);
                    if let Some(t) = attrs.get("type") {
                        service.service_type = ServiceType::from_str(t)
                            .ok_or_else(|| {
                                DvbError::CatalogParse(format!("bad service type {t}"))
                            })?;
                    }
                    if let Some(s) = attrs.get("status") {
                        service.status = RunningStatus::from_str(s).ok_or_else(|| {
                            DvbError::CatalogParse(format!("bad service status {s}"))
                        })?;
                    }
                    service.scrambled =
                        attrs.get("scrambled").map(String::as_str) == Some("1");
                    if self_closing {
                        let tid = current_transponder.ok_or_else(|| {
                            DvbError::CatalogParse("service outside transponder".into())
                        })?;
                        catalog.add_service(tid, service);
                    } else {
                        current_service = Some(service);
                    }
                }
                b"stream" => {
                    let service = current_service.as_mut().ok_or_else(|| {
                        DvbError::CatalogParse("stream outside service".into())
                    })?;
                    service.add_stream(ElementaryStream {
                        pid: parse_num(&attrs, "pid")? as u16,
                        stream_type: parse_num(&attrs, "type")? as u8,
                        language: attrs.get("lang").cloned(),
                        descriptors: Vec::new(),
                    });
                }
                other => {
                    return Err(DvbError::CatalogParse(format!(
                        "unexpected element {}",
                        String::from_utf8_lossy(other)
                    )));
                }
            }
        }
        Ok(catalog)
    }
}

fn collect_attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DvbError::CatalogParse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| DvbError::CatalogParse(e.to_string()))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn required<'a>(attrs: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| DvbError::CatalogParse(format!("missing attribute {key}")))
}

fn parse_num(attrs: &HashMap<String, String>, key: &str) -> Result<u64> {
    required(attrs, key)?
        .parse()
        .map_err(|_| DvbError::CatalogParse(format!("bad number in attribute {key}")))
}

fn parse_tuning(system: DeliverySystem, attrs: &HashMap<String, String>) -> Result<TuningParams> {
    let frequency = parse_num(attrs, "frequency")?;
    let bad = |what: &str| DvbError::CatalogParse(format!("bad {what} attribute"));
    match system {
        DeliverySystem::Terrestrial => Ok(TuningParams::Terrestrial {
            frequency,
            bandwidth: Bandwidth::from_str(required(attrs, "bandwidth")?)
                .ok_or_else(|| bad("bandwidth"))?,
            modulation: Modulation::from_str(required(attrs, "modulation")?)
                .ok_or_else(|| bad("modulation"))?,
            code_rate_hp: FecRate::from_str(required(attrs, "fec")?).ok_or_else(|| bad("fec"))?,
            code_rate_lp: match attrs.get("feclp") {
                Some(s) => FecRate::from_str(s).ok_or_else(|| bad("feclp"))?,
                None => FecRate::None,
            },
        }),
        DeliverySystem::Satellite => Ok(TuningParams::Satellite {
            frequency,
            polarization: Polarization::from_str(required(attrs, "polarization")?)
                .ok_or_else(|| bad("polarization"))?,
            symbol_rate: parse_num(attrs, "symbolrate")? as u32,
            fec: FecRate::from_str(required(attrs, "fec")?).ok_or_else(|| bad("fec"))?,
            orbital: attrs.get("orbital").cloned(),
        }),
        DeliverySystem::Cable => Ok(TuningParams::Cable {
            frequency,
            symbol_rate: parse_num(attrs, "symbolrate")? as u32,
            modulation: Modulation::from_str(required(attrs, "modulation")?)
                .ok_or_else(|| bad("modulation"))?,
            fec: FecRate::from_str(required(attrs, "fec")?).ok_or_else(|| bad("fec"))?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::pmt::stream_type;

    fn sample_catalog() -> Catalog {
        let mut catalog = Catalog::new();

        let t1 = catalog.insert_transponder(
            "adapter0",
            0,
            Transponder::new(TuningParams::Terrestrial {
                frequency: 506_000_000,
                bandwidth: Bandwidth::Mhz8,
                modulation: Modulation::Qam64,
                code_rate_hp: FecRate::Fec2_3,
                code_rate_lp: FecRate::Fec1_2,
            }),
        );
        let t2 = catalog.insert_transponder(
            "adapter1",
            0,
            Transponder::new(TuningParams::Satellite {
                frequency: 11_836_000_000,
                polarization: Polarization::Horizontal,
                symbol_rate: 27_500_000,
                fec: FecRate::Fec3_4,
                orbital: Some("19.2E".to_string()),
            }),
        );

        let mut a = Service::new("Channel-A", 101, 256);
        a.provider = "Provider".to_string();
        a.service_type = ServiceType::DigitalTelevision;
        a.status = RunningStatus::Running;
        a.set_pcr_pid(512);
        a.add_stream(ElementaryStream {
            pid: 512,
            stream_type: stream_type::MPEG2_VIDEO,
            language: None,
            descriptors: Vec::new(),
        });
        a.add_stream(ElementaryStream {
            pid: 513,
            stream_type: stream_type::MPEG1_AUDIO,
            language: Some("deu".to_string()),
            descriptors: Vec::new(),
        });
        catalog.add_service(t1, a);

        let mut a2 = Service::new("Channel-A", 4011, 1024);
        a2.provider = "SatProvider".to_string();
        a2.service_type = ServiceType::AdvancedCodecHdDigitalTelevision;
        a2.status = RunningStatus::Running;
        a2.scrambled = true;
        catalog.add_service(t2, a2);

        let mut b = Service::new("Radio-B", 102, 272);
        b.service_type = ServiceType::DigitalRadioSound;
        b.status = RunningStatus::Running;
        b.add_stream(ElementaryStream {
            pid: 560,
            stream_type: stream_type::MPEG1_AUDIO,
            language: Some("eng".to_string()),
            descriptors: Vec::new(),
        });
        catalog.add_service(t1, b);

        catalog
    }

    #[test]
    fn xml_round_trip() {
        let catalog = sample_catalog();
        let xml = catalog.to_xml().unwrap();
        let parsed = Catalog::from_xml(&xml).unwrap();
        assert_eq!(parsed, catalog);
    }

    #[test]
    fn scan_order_is_preference_order() {
        let catalog = sample_catalog();
        let tids = catalog.transponders_for("Channel-A");
        assert_eq!(tids.len(), 2);
        assert_eq!(catalog.first_transponder("Channel-A"), Some(tids[0]));
        assert_eq!(
            catalog.transponder(tids[0]).transponder.system(),
            DeliverySystem::Terrestrial
        );
    }

    #[test]
    fn duplicate_transponder_is_reused() {
        let mut catalog = Catalog::new();
        let mk = || {
            Transponder::new(TuningParams::Cable {
                frequency: 346_000_000,
                symbol_rate: 6_900_000,
                modulation: Modulation::Qam256,
                fec: FecRate::None,
            })
        };
        let t1 = catalog.insert_transponder("adapter0", 0, mk());
        let t2 = catalog.insert_transponder("adapter0", 0, mk());
        assert_eq!(t1, t2);
        assert_eq!(catalog.transponder_count(), 1);
    }

    #[test]
    fn duplicate_service_name_on_same_transponder_registers_once() {
        let mut catalog = Catalog::new();
        let t = catalog.insert_transponder(
            "adapter0",
            0,
            Transponder::new(TuningParams::Terrestrial {
                frequency: 1,
                bandwidth: Bandwidth::Mhz8,
                modulation: Modulation::Auto,
                code_rate_hp: FecRate::Auto,
                code_rate_lp: FecRate::Auto,
            }),
        );
        catalog.add_service(t, Service::new("Twice", 1, 16));
        catalog.add_service(t, Service::new("Twice", 2, 17));
        assert_eq!(catalog.transponders_for("Twice").len(), 1);
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        assert!(matches!(
            Catalog::from_xml("<dvbdevice><bogus/></dvbdevice>"),
            Err(DvbError::CatalogParse(_))
        ));
        assert!(Catalog::from_xml("not xml at all <<<").is_err());
    }

    #[test]
    fn empty_catalog_round_trips() {
        let xml = Catalog::new().to_xml().unwrap();
        let parsed = Catalog::from_xml(&xml).unwrap();
        assert!(parsed.is_empty());
    }
}
