//! Dynamic linking constants, pseudo-handles and request codes.
//!
//! Values follow the shim's own `<dlfcn.h>`, not glibc's: the mode and
//! request enumerations are dense and start at 1.

/// dlopen mode flags. Accepted and recorded, never behaviorally differentiated.
pub const RTLD_LAZY: i32 = 1;
pub const RTLD_NOW: i32 = 2;
pub const RTLD_GLOBAL: i32 = 3;
pub const RTLD_LOCAL: i32 = 4;
pub const RTLD_MAX: i32 = 4;

/// dlinfo request codes.
pub const RTLD_DI_LMID: i32 = 1;
pub const RTLD_DI_LINKMAP: i32 = 2;
pub const RTLD_DI_CONFIGADDR: i32 = 3;
pub const RTLD_DI_SERINFO: i32 = 4;
pub const RTLD_DI_SERINFOSIZE: i32 = 5;
pub const RTLD_DI_ORIGIN: i32 = 6;
pub const RTLD_DI_PROFILENAME: i32 = 7;
pub const RTLD_DI_PROFILEOUT: i32 = 8;
pub const RTLD_DI_TLS_MODID: i32 = 9;
pub const RTLD_DI_TLS_DATA: i32 = 10;
pub const RTLD_DI_MAX: i32 = 10;

/// dladdr1 flags.
pub const RTLD_DL_SYMENT: i32 = 1;
pub const RTLD_DL_LINKMAP: i32 = 2;
pub const RTLD_DL_MAX: i32 = 2;

/// Binding mode passed to `dlopen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlMode {
    Lazy,
    Now,
    Global,
    Local,
    /// Anything outside the enumerated set. Still accepted.
    Other(i32),
}

impl From<i32> for DlMode {
    fn from(value: i32) -> Self {
        match value {
            RTLD_LAZY => Self::Lazy,
            RTLD_NOW => Self::Now,
            RTLD_GLOBAL => Self::Global,
            RTLD_LOCAL => Self::Local,
            other => Self::Other(other),
        }
    }
}

/// `dlinfo` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoRequest {
    LinkMapId,
    LinkMap,
    ConfigAddr,
    ServerInfo,
    ServerInfoSize,
    Origin,
    ProfileName,
    ProfileOut,
    TlsModuleId,
    TlsData,
}

impl InfoRequest {
    /// Every recognized request, in code order.
    pub const ALL: [Self; 10] = [
        Self::LinkMapId,
        Self::LinkMap,
        Self::ConfigAddr,
        Self::ServerInfo,
        Self::ServerInfoSize,
        Self::Origin,
        Self::ProfileName,
        Self::ProfileOut,
        Self::TlsModuleId,
        Self::TlsData,
    ];

    /// Raw request code.
    pub fn code(self) -> i32 {
        match self {
            Self::LinkMapId => RTLD_DI_LMID,
            Self::LinkMap => RTLD_DI_LINKMAP,
            Self::ConfigAddr => RTLD_DI_CONFIGADDR,
            Self::ServerInfo => RTLD_DI_SERINFO,
            Self::ServerInfoSize => RTLD_DI_SERINFOSIZE,
            Self::Origin => RTLD_DI_ORIGIN,
            Self::ProfileName => RTLD_DI_PROFILENAME,
            Self::ProfileOut => RTLD_DI_PROFILEOUT,
            Self::TlsModuleId => RTLD_DI_TLS_MODID,
            Self::TlsData => RTLD_DI_TLS_DATA,
        }
    }
}

impl TryFrom<i32> for InfoRequest {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            RTLD_DI_LMID..=RTLD_DI_MAX => Ok(Self::ALL[(value - 1) as usize]),
            other => Err(other),
        }
    }
}

/// Flags accepted by `dladdr1`. Recorded only; no extended detail is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrFlags(pub i32);

/// Opaque module handle handed to callers.
///
/// Real handles wrap the host-native identifier unchanged. Three values are
/// reserved: [`ModuleHandle::DEFAULT`] (search every module),
/// [`ModuleHandle::NEXT`] (recognized, unsupported) and
/// [`ModuleHandle::PROCESS`] (the running image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(usize);

impl ModuleHandle {
    pub const DEFAULT: Self = Self(0);
    pub const NEXT: Self = Self(usize::MAX);
    pub const PROCESS: Self = Self(usize::MAX - 1);

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// `true` for any of the reserved values.
    #[inline]
    pub fn is_pseudo(self) -> bool {
        self == Self::DEFAULT || self == Self::NEXT || self == Self::PROCESS
    }
}

impl std::fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
