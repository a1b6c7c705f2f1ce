//! Call-frame-information event log.
//!
//! The emitter logs one event per prologue instruction; the EH modules
//! lower the log to DWARF CFA rows (SysV) or `UNWIND_CODE`s (Win64).

/// One prologue event at a code offset within the function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiEvent {
    /// `push rbp`: CFA offset becomes 16, RBP saved at CFA-16.
    PushRbp { code_offset: u32 },
    /// `mov rbp, rsp`: CFA is RBP-based from here.
    MovRbpRsp { code_offset: u32 },
    /// `sub rsp, N`: frame allocation.
    SubRsp { code_offset: u32, amount: u32 },
}

impl CfiEvent {
    pub fn code_offset(&self) -> u32 {
        match *self {
            CfiEvent::PushRbp { code_offset }
            | CfiEvent::MovRbpRsp { code_offset }
            | CfiEvent::SubRsp { code_offset, .. } => code_offset,
        }
    }
}

/// The prologue log for one function.
#[derive(Clone, Debug, Default)]
pub struct CfiLog {
    pub events: Vec<CfiEvent>,
}

impl CfiLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: CfiEvent) {
        self.events.push(event);
    }

    /// Offset of the end of the prologue (one past the last event's
    /// instruction start; the emitter records the post-instruction offset).
    pub fn prologue_end(&self) -> u32 {
        self.events.iter().map(CfiEvent::code_offset).max().unwrap_or(0)
    }

    /// Total frame allocation recorded by `SubRsp` events.
    pub fn frame_allocation(&self) -> u32 {
        self.events
            .iter()
            .map(|e| match *e {
                CfiEvent::SubRsp { amount, .. } => amount,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_order_and_queries() {
        let mut log = CfiLog::new();
        log.push(CfiEvent::PushRbp { code_offset: 1 });
        log.push(CfiEvent::MovRbpRsp { code_offset: 4 });
        log.push(CfiEvent::SubRsp { code_offset: 8, amount: 48 });
        assert_eq!(log.prologue_end(), 8);
        assert_eq!(log.frame_allocation(), 48);
        assert_eq!(log.events.len(), 3);
    }
}
