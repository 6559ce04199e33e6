use fxhash::FxHashMap;

/// Register address spaces of the instrument.
///
/// Register names are only unique within one space; the same name may map to
/// different identifiers on a ROC, a TBM core or the testboard itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSpace {
    Roc,
    Tbm,
    Testboard,
}

/// Identifier and declared value limit of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub id: u8,
    pub max: u8,
}

/// Signal probe outputs of the testboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    D1,
    D2,
    A1,
    A2,
}

impl Probe {
    pub fn is_digital(&self) -> bool {
        matches!(self, Probe::D1 | Probe::D2)
    }
}

/// Register id of the deserializer phase delay on the testboard.
///
/// The acquisition session needs this one delay value to pick the right
/// deserializer setting when opening the readout.
pub const DESER160_PHASE: u8 = 0x04;

/// Name lookup tables for registers, device types, probe signals and pattern
/// generator signals.
///
/// All lookups are case-insensitive. The tables are plain data handed to the
/// engine at construction; [`Registry::default`] carries the standard
/// instrument dictionary.
#[derive(Debug, Clone)]
pub struct Registry {
    roc_registers: FxHashMap<String, RegisterSpec>,
    tbm_registers: FxHashMap<String, RegisterSpec>,
    dtb_registers: FxHashMap<String, RegisterSpec>,
    device_types: FxHashMap<String, u8>,
    digital_probes: FxHashMap<String, u8>,
    analog_probes: FxHashMap<String, u8>,
    pg_signals: FxHashMap<String, u16>,
}

impl Registry {
    /// Look up a register by name within one address space.
    pub fn register(&self, name: &str, space: RegisterSpace) -> Option<RegisterSpec> {
        let table = match space {
            RegisterSpace::Roc => &self.roc_registers,
            RegisterSpace::Tbm => &self.tbm_registers,
            RegisterSpace::Testboard => &self.dtb_registers,
        };
        table.get(&name.to_ascii_lowercase()).copied()
    }

    /// Look up the device type code for a named chip or core flavor.
    pub fn device_code(&self, name: &str) -> Option<u8> {
        self.device_types.get(&name.to_ascii_lowercase()).copied()
    }

    /// Look up a probe signal code in the digital or analog namespace.
    pub fn probe_signal(&self, probe: Probe, name: &str) -> Option<u8> {
        let table = if probe.is_digital() {
            &self.digital_probes
        } else {
            &self.analog_probes
        };
        table.get(&name.to_ascii_lowercase()).copied()
    }

    /// Look up a single pattern generator signal name.
    ///
    /// Combining several signals into one mask (`"cal;trg"`) is done by the
    /// configuration validator, which sums the individual lookups.
    pub fn pattern_signal(&self, name: &str) -> Option<u16> {
        self.pg_signals.get(&name.to_ascii_lowercase()).copied()
    }
}

fn table<V: Copy>(entries: &[(&str, V)]) -> FxHashMap<String, V> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

fn register_table(entries: &[(&str, u8, u8)]) -> FxHashMap<String, RegisterSpec> {
    entries
        .iter()
        .map(|(name, id, max)| (name.to_string(), RegisterSpec { id: *id, max: *max }))
        .collect()
}

impl Default for Registry {
    /// The standard dictionary of the supported chip generations.
    fn default() -> Self {
        Registry {
            roc_registers: register_table(&[
                ("vdig", 0x01, 15),
                ("vana", 0x02, 255),
                ("vsh", 0x03, 255),
                ("vcomp", 0x04, 15),
                ("vwllpr", 0x07, 255),
                ("vwllsh", 0x09, 255),
                ("vhlddel", 0x0a, 255),
                ("vtrim", 0x0b, 255),
                ("vthrcomp", 0x0c, 255),
                ("vibias_bus", 0x0d, 255),
                ("vbias_sf", 0x0e, 15),
                ("voffsetop", 0x0f, 255),
                ("voffsetro", 0x11, 255),
                ("vion", 0x12, 255),
                ("vcomp_adc", 0x13, 255),
                ("vicolor", 0x14, 255),
                ("vcal", 0x19, 255),
                ("caldel", 0x1a, 255),
                ("ctrlreg", 0xfd, 255),
                ("wbc", 0xfe, 255),
                ("readback", 0xff, 15),
            ]),
            tbm_registers: register_table(&[
                ("base0", 0x00, 255),
                ("base2", 0x02, 255),
                ("base4", 0x04, 255),
                ("base8", 0x08, 255),
                ("basea", 0x0a, 255),
                ("basec", 0x0c, 255),
                ("basee", 0x0e, 255),
            ]),
            dtb_registers: register_table(&[
                ("clk", 0x00, 255),
                ("ctr", 0x01, 255),
                ("sda", 0x02, 255),
                ("tin", 0x03, 255),
                ("deser160phase", DESER160_PHASE, 7),
                ("level", 0x05, 15),
                ("triggerdelay", 0x06, 255),
            ]),
            device_types: table(&[
                ("psi46v2", 0x01),
                ("psi46dig", 0x02),
                ("psi46digv2", 0x03),
                ("psi46digv21respin", 0x04),
                ("tbm08", 0x20),
                ("tbm08b", 0x21),
                ("tbm09", 0x22),
            ]),
            digital_probes: table(&[
                ("off", 0x00),
                ("clk", 0x01),
                ("sda", 0x02),
                ("tout", 0x03),
                ("trig", 0x04),
                ("ctr", 0x05),
            ]),
            analog_probes: table(&[
                ("off", 0x00),
                ("tout", 0x01),
                ("sdata1", 0x02),
                ("sdata2", 0x03),
            ]),
            pg_signals: table(&[
                ("delay", 0x0000),
                ("tok", 0x0100),
                ("trg", 0x0200),
                ("cal", 0x0400),
                ("resr", 0x0800),
                ("rest", 0x1000),
                ("sync", 0x2000),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_case_insensitive() {
        let registry = Registry::default();
        let lower = registry.register("vcal", RegisterSpace::Roc).unwrap();
        let upper = registry.register("VCal", RegisterSpace::Roc).unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.id, 0x19);
        assert_eq!(lower.max, 255);
    }

    #[test]
    fn test_register_namespaces_are_scoped() {
        let registry = Registry::default();
        assert!(registry.register("base0", RegisterSpace::Tbm).is_some());
        assert!(registry.register("base0", RegisterSpace::Roc).is_none());
        assert!(registry.register("deser160phase", RegisterSpace::Testboard).is_some());
    }

    #[test]
    fn test_unknown_names_return_none() {
        let registry = Registry::default();
        assert!(registry.register("notaregister", RegisterSpace::Roc).is_none());
        assert!(registry.device_code("notachip").is_none());
        assert!(registry.pattern_signal("notasignal").is_none());
    }

    #[test]
    fn test_probe_namespaces() {
        let registry = Registry::default();
        assert_eq!(registry.probe_signal(Probe::D1, "clk"), Some(0x01));
        assert_eq!(registry.probe_signal(Probe::A1, "sdata1"), Some(0x02));
        assert!(registry.probe_signal(Probe::A2, "clk").is_none());
    }
}
