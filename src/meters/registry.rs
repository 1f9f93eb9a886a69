//! # Driver Registry
//!
//! A process wide map of driver name to [`DriverInfo`]. Built-in drivers
//! register from [`crate::meters::drivers::register_all`] at first use;
//! dynamically loaded drivers may replace a built-in with the same name or
//! detection triplet, but never another file-loaded driver.

use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock};

use log::{debug, warn};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::bus::LinkModeSet;
use crate::meters::{Meter, MeterType};
use crate::telegram::Telegram;
use crate::translate::Lookup;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Two drivers trying to register the name \"{0}\"")]
    DuplicateName(String),

    #[error("Driver {new} tried to register the same detection combo as driver {old}: mvt={mfct},{version:02x},{mtype:02x}")]
    DuplicateDetection {
        new: String,
        old: String,
        mfct: String,
        version: u8,
        mtype: u8,
    },

    #[error("Unknown driver name \"{0}\"")]
    UnknownDriver(String),
}

/// One (manufacturer, type, version) detection triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverDetect {
    pub mfct: u16,
    pub mtype: u8,
    pub version: u8,
}

/// Driver specific post-extraction logic, for the few meters whose
/// payloads are not expressible as field matchers alone.
pub trait ContentProcessor: Send + Sync {
    fn process_content(&self, meter: &mut Meter, t: &Telegram);
}

/// Everything the framework needs to know about one driver.
#[derive(Clone)]
pub struct DriverInfo {
    pub name: String,
    pub name_aliases: Vec<String>,
    pub meter_type: MeterType,
    pub default_fields: Vec<String>,
    pub detect: Vec<DriverDetect>,
    pub default_link_modes: LinkModeSet,
    /// Legacy quirk: manufacturer data starts at this APL index without a
    /// 0x0F marker.
    pub force_mfct_index: Option<usize>,
    pub mfct_tpl_status_bits: Option<Lookup>,
    /// Populates the meter's field schemas.
    pub setup_fields: Arc<dyn Fn(&mut Meter) + Send + Sync>,
    pub content_processor: Option<Arc<dyn ContentProcessor>>,
    /// Set when loaded from a driver file.
    pub dynamic_file_name: Option<String>,
}

impl std::fmt::Debug for DriverInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverInfo")
            .field("name", &self.name)
            .field("meter_type", &self.meter_type)
            .field("detect", &self.detect)
            .finish()
    }
}

impl DriverInfo {
    pub fn new(name: &str, meter_type: MeterType) -> DriverInfo {
        DriverInfo {
            name: name.to_string(),
            name_aliases: Vec::new(),
            meter_type,
            default_fields: Vec::new(),
            detect: Vec::new(),
            default_link_modes: LinkModeSet::default(),
            force_mfct_index: None,
            mfct_tpl_status_bits: None,
            setup_fields: Arc::new(|_| {}),
            content_processor: None,
            dynamic_file_name: None,
        }
    }

    pub fn detects(&self, mfct: u16, mtype: u8, version: u8) -> bool {
        self.detect.iter().any(|d| {
            !(d.mfct == 0 && d.mtype == 0 && d.version == 0)
                && d.mfct == (mfct & 0x7fff)
                && d.mtype == mtype
                && d.version == version
        })
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic_file_name.is_some()
    }
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, DriverInfo>,
    order: Vec<String>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));
static BUILTINS: Once = Once::new();

fn ensure_builtins() {
    BUILTINS.call_once(|| {
        crate::meters::drivers::register_all();
    });
}

fn find_detection_clash(reg: &Registry, di: &DriverInfo) -> Option<(String, DriverDetect)> {
    for d in &di.detect {
        for name in &reg.order {
            let other = &reg.by_name[name];
            if other.name == di.name {
                continue;
            }
            if other.detects(d.mfct, d.mtype, d.version) {
                return Some((other.name.clone(), *d));
            }
        }
    }
    None
}

/// Register a built-in driver. Name and detection collisions are fatal
/// configuration errors.
pub fn register_driver(di: DriverInfo) -> Result<(), DriverError> {
    let mut reg = REGISTRY.write().unwrap();
    if reg.by_name.contains_key(&di.name) {
        return Err(DriverError::DuplicateName(di.name));
    }
    if let Some((old, d)) = find_detection_clash(&reg, &di) {
        return Err(DriverError::DuplicateDetection {
            new: di.name,
            old,
            mfct: crate::address::manufacturer_flag(d.mfct),
            version: d.version,
            mtype: d.mtype,
        });
    }
    reg.order.push(di.name.clone());
    reg.by_name.insert(di.name.clone(), di);
    Ok(())
}

/// Register a driver loaded from a file. Replacing a built-in driver with
/// the same name or detection triplet is allowed; replacing another
/// file-loaded driver is not.
pub fn register_dynamic_driver(di: DriverInfo) -> Result<(), DriverError> {
    ensure_builtins();
    let mut reg = REGISTRY.write().unwrap();

    let existing_is_dynamic = reg.by_name.get(&di.name).map(|old| old.is_dynamic());
    if let Some(is_dynamic) = existing_is_dynamic {
        if is_dynamic {
            return Err(DriverError::DuplicateName(di.name));
        }
        debug!("(driver) newly loaded driver {} overrides builtin", di.name);
        let name = di.name.clone();
        reg.order.retain(|n| *n != name);
        reg.by_name.remove(&name);
    }

    while let Some((old_name, d)) = find_detection_clash(&reg, &di) {
        if reg.by_name[&old_name].is_dynamic() {
            return Err(DriverError::DuplicateDetection {
                new: di.name,
                old: old_name,
                mfct: crate::address::manufacturer_flag(d.mfct),
                version: d.version,
                mtype: d.mtype,
            });
        }
        warn!(
            "(driver) newly loaded driver {} forces removal of builtin driver {old_name} since it auto-detects the same combo",
            di.name
        );
        reg.order.retain(|n| *n != old_name);
        reg.by_name.remove(&old_name);
    }

    reg.order.push(di.name.clone());
    reg.by_name.insert(di.name.clone(), di);
    Ok(())
}

/// Find a driver by name or alias.
pub fn lookup_driver(name: &str) -> Option<DriverInfo> {
    ensure_builtins();
    let reg = REGISTRY.read().unwrap();
    if let Some(di) = reg.by_name.get(name) {
        return Some(di.clone());
    }
    for n in &reg.order {
        let di = &reg.by_name[n];
        if di.name_aliases.iter().any(|a| a == name) {
            return Some(di.clone());
        }
    }
    None
}

/// All drivers whose detection triplets match the given identity.
pub fn drivers_detecting(mfct: u16, mtype: u8, version: u8) -> Vec<String> {
    ensure_builtins();
    let reg = REGISTRY.read().unwrap();
    reg.order
        .iter()
        .filter(|n| reg.by_name[*n].detects(mfct, mtype, version))
        .cloned()
        .collect()
}

/// Does this driver's detection list cover the identity? Used for the
/// wrong-driver warning.
pub fn is_driver_valid_for(driver_name: &str, mfct: u16, mtype: u8, version: u8) -> bool {
    lookup_driver(driver_name)
        .map(|di| di.detects(mfct, mtype, version))
        .unwrap_or(false)
}

pub fn all_driver_names() -> Vec<String> {
    ensure_builtins();
    let reg = REGISTRY.read().unwrap();
    reg.order.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::flag_to_manufacturer;

    #[test]
    fn test_builtin_drivers_registered() {
        let names = all_driver_names();
        assert!(names.contains(&"kamheat".to_string()));
        assert!(names.contains(&"apatorna1".to_string()));
        assert!(names.contains(&"iem3000".to_string()));
    }

    #[test]
    fn test_alias_lookup() {
        let di = lookup_driver("multical302").expect("alias resolves");
        assert_eq!(di.name, "kamheat");
    }

    #[test]
    fn test_detection() {
        let kam = flag_to_manufacturer("KAM").unwrap();
        let names = drivers_detecting(kam, 0x04, 0x30);
        assert_eq!(names, vec!["kamheat".to_string()]);
        assert!(is_driver_valid_for("kamheat", kam, 0x04, 0x30));
        assert!(!is_driver_valid_for("kamheat", kam, 0x99, 0x99));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let _ = all_driver_names(); // builtins registered first
        let di = DriverInfo::new("kamheat", MeterType::HeatMeter);
        assert!(matches!(
            register_driver(di),
            Err(DriverError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_duplicate_detection_rejected() {
        let _ = all_driver_names(); // builtins registered first
        let kam = flag_to_manufacturer("KAM").unwrap();
        let mut di = DriverInfo::new("kamclone", MeterType::HeatMeter);
        di.detect.push(DriverDetect {
            mfct: kam,
            mtype: 0x04,
            version: 0x30,
        });
        assert!(matches!(
            register_driver(di),
            Err(DriverError::DuplicateDetection { .. })
        ));
    }
}
