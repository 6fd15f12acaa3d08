use crate::{I2cBus, I2cConfig, Result, TransportError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-process register file standing in for one device.
///
/// Each register address holds a byte string: one byte for 8-bit registers,
/// MSB-first pairs for 16-bit ones. Reads shorter than the stored string are
/// truncated, longer ones are zero padded.
pub struct MockBus {
    cfg: I2cConfig,
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    regs: HashMap<u8, Vec<u8>>,
    scripted: HashMap<u8, VecDeque<Vec<u8>>>,
    writes: Vec<(u8, Vec<u8>)>,
    fail_next: u32,
    fail_regs: HashSet<u8>,
    absent: bool,
    closed: bool,
    transactions: u64,
}

/// Test-side view of a [`MockBus`]; clones share the same register file.
#[derive(Clone, Debug, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBus {
    /// Like [`I2cBus::open`] but skips validation so tests can build any endpoint.
    pub fn new(cfg: I2cConfig) -> Self {
        Self {
            cfg,
            state: Arc::default(),
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn begin(&self, reg: u8) -> Result<MutexGuard<'_, MockState>> {
        let mut st = lock(&self.state);
        st.transactions += 1;
        if st.closed {
            return Err(TransportError::Io("mock bus closed".into()));
        }
        if st.absent {
            return Err(TransportError::NoDevice {
                bus: self.cfg.bus,
                address: self.cfg.address,
            });
        }
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(TransportError::Io("injected failure".into()));
        }
        if st.fail_regs.contains(&reg) {
            return Err(TransportError::Io(format!(
                "injected failure on register 0x{reg:02X}"
            )));
        }
        Ok(st)
    }
}

impl MockState {
    fn fetch(&mut self, reg: u8, len: usize) -> Vec<u8> {
        let mut bytes = match self.scripted.get_mut(&reg).and_then(|q| q.pop_front()) {
            Some(v) => v,
            None => self.regs.get(&reg).cloned().unwrap_or_default(),
        };
        bytes.resize(len, 0);
        bytes
    }

    fn store(&mut self, reg: u8, data: &[u8]) {
        self.regs.insert(reg, data.to_vec());
        self.writes.push((reg, data.to_vec()));
    }
}

impl I2cBus for MockBus {
    fn open(cfg: &I2cConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(*cfg))
    }

    fn config(&self) -> &I2cConfig {
        &self.cfg
    }

    fn read_u8(&mut self, reg: u8) -> Result<u8> {
        let mut st = self.begin(reg)?;
        Ok(st.fetch(reg, 1)[0])
    }

    fn write_u8(&mut self, reg: u8, value: u8) -> Result<()> {
        let mut st = self.begin(reg)?;
        st.store(reg, &[value]);
        Ok(())
    }

    fn read_block(&mut self, reg: u8, len: usize) -> Result<Vec<u8>> {
        let mut st = self.begin(reg)?;
        Ok(st.fetch(reg, len))
    }

    fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        let mut st = self.begin(reg)?;
        st.store(reg, data);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

impl MockHandle {
    pub fn set_u8(&self, reg: u8, value: u8) {
        lock(&self.state).regs.insert(reg, vec![value]);
    }

    pub fn set_u16(&self, reg: u8, value: u16) {
        lock(&self.state)
            .regs
            .insert(reg, value.to_be_bytes().to_vec());
    }

    pub fn set_bytes(&self, reg: u8, data: &[u8]) {
        lock(&self.state).regs.insert(reg, data.to_vec());
    }

    /// Queue one-byte values returned by successive reads of `reg` before the
    /// stored value is used again, e.g. a status bit that clears after N polls.
    pub fn script_u8(&self, reg: u8, values: impl IntoIterator<Item = u8>) {
        let mut st = lock(&self.state);
        let q = st.scripted.entry(reg).or_default();
        q.extend(values.into_iter().map(|v| vec![v]));
    }

    pub fn bytes(&self, reg: u8) -> Option<Vec<u8>> {
        lock(&self.state).regs.get(&reg).cloned()
    }

    pub fn u8_at(&self, reg: u8) -> Option<u8> {
        self.bytes(reg).and_then(|b| b.first().copied())
    }

    pub fn u16_at(&self, reg: u8) -> Option<u16> {
        let b = self.bytes(reg)?;
        match b.as_slice() {
            [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Every write in issue order as `(register, bytes)`.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    pub fn writes_to(&self, reg: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Fail the next `n` transactions with a transient I/O error.
    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    pub fn fail_register(&self, reg: u8) {
        lock(&self.state).fail_regs.insert(reg);
    }

    pub fn clear_failures(&self) {
        let mut st = lock(&self.state);
        st.fail_next = 0;
        st.fail_regs.clear();
        st.absent = false;
    }

    /// Make every transaction report a missing device.
    pub fn set_absent(&self, absent: bool) {
        lock(&self.state).absent = absent;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn transactions(&self) -> u64 {
        lock(&self.state).transactions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> MockBus {
        MockBus::new(I2cConfig::new(1, 0x40).unwrap())
    }

    #[test]
    fn test_reads_default_to_zero() {
        let mut b = bus();
        assert_eq!(b.read_u8(0x10).unwrap(), 0);
        assert_eq!(b.read_block(0x10, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_word_stored_msb_first() {
        let mut b = bus();
        let h = b.handle();
        h.set_u16(0x02, 0x1234);
        assert_eq!(b.read_block(0x02, 2).unwrap(), vec![0x12, 0x34]);
        b.write_block(0x00, &[0xAB, 0xCD]).unwrap();
        assert_eq!(h.u16_at(0x00), Some(0xABCD));
        assert_eq!(h.writes_to(0x00), vec![vec![0xAB, 0xCD]]);
    }

    #[test]
    fn test_scripted_reads_run_before_stored_value() {
        let mut b = bus();
        let h = b.handle();
        h.set_u8(0x0C, 0x00);
        h.script_u8(0x0C, [0x01, 0x01]);
        assert_eq!(b.read_u8(0x0C).unwrap(), 0x01);
        assert_eq!(b.read_u8(0x0C).unwrap(), 0x01);
        assert_eq!(b.read_u8(0x0C).unwrap(), 0x00);
    }

    #[test]
    fn test_injected_failures() {
        let mut b = bus();
        let h = b.handle();
        h.fail_next(1);
        let err = b.read_u8(0x00).unwrap_err();
        assert!(err.is_transient());
        assert!(b.read_u8(0x00).is_ok());

        h.fail_register(0x03);
        assert!(b.read_block(0x03, 2).is_err());
        assert!(b.read_block(0x02, 2).is_ok());

        h.set_absent(true);
        let err = b.read_u8(0x02).unwrap_err();
        assert!(matches!(err, TransportError::NoDevice { address: 0x40, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_close_rejects_further_io() {
        let mut b = bus();
        let h = b.handle();
        b.close().unwrap();
        b.close().unwrap();
        assert!(h.is_closed());
        assert!(b.write_u8(0x00, 1).is_err());
    }

    #[test]
    fn test_open_validates_address() {
        let cfg = I2cConfig {
            bus: 0,
            address: 0x78,
            clock_frequency_hz: 100_000.0,
        };
        assert!(matches!(
            MockBus::open(&cfg),
            Err(TransportError::InvalidAddress(0x78))
        ));
    }
}
