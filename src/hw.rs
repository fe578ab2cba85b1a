#[derive(Debug, Clone, Copy)]
pub struct HwInfo {
    pub logical_cpus: usize,
}

pub fn detect_hw() -> HwInfo {
    HwInfo {
        logical_cpus: num_cpus::get(),
    }
}
