use std::fmt;

bitflags::bitflags! {
    /// Security context request and state flags.
    ///
    /// Initiators pass the requested set to [`Provider::initiator`]; after a
    /// context is established [`SecurityContext::flags`] reports what was
    /// actually negotiated.
    ///
    /// [`Provider::initiator`]: crate::Provider::initiator
    /// [`SecurityContext::flags`]: crate::SecurityContext::flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        const DELEG = 0x1;
        const MUTUAL = 0x2;
        const REPLAY = 0x4;
        const SEQUENCE = 0x8;
        const CONF = 0x10;
        const INTEG = 0x20;
        const ANON = 0x40;
        const CHANNEL_BOUND = 0x800;
        const DCE_STYLE = 0x1000;
        const IDENTIFY = 0x2000;
        const EXTENDED_ERROR = 0x4000;
    }
}

/// Human-readable name of a single flag.
pub fn flag_name(flag: ContextFlags) -> &'static str {
    match flag {
        ContextFlags::DELEG => "Delegation",
        ContextFlags::MUTUAL => "Mutual authentication",
        ContextFlags::REPLAY => "Message replay detection",
        ContextFlags::SEQUENCE => "Out of sequence message detection",
        ContextFlags::CONF => "Confidentiality",
        ContextFlags::INTEG => "Integrity",
        ContextFlags::ANON => "Anonymous",
        ContextFlags::CHANNEL_BOUND => "Channel Bindings",
        ContextFlags::DCE_STYLE => "DCE style",
        ContextFlags::IDENTIFY => "Identify only",
        ContextFlags::EXTENDED_ERROR => "Extended errors",
        _ => "Unknown",
    }
}

impl fmt::Display for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(flag_name(flag))?;
            first = false;
        }
        Ok(())
    }
}
