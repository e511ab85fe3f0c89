macro_rules! multi_error {
    ($name:ident($($manual:ident),*); $($err:ident = $obj:ty);*) => {
        pub mod $name {
            use backtrace::Backtrace;

            #[derive(Debug)]
            pub enum Inner {
                $($err($obj),)*
                $($manual),*
            }

            impl std::fmt::Display for Inner { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { std::fmt::Debug::fmt(self, f) } }
            impl std::error::Error for Inner {}

            $(impl From<$obj> for Inner { fn from(value: $obj) -> Self { Self::$err(value) } })*

            pub struct Error {
                inner: Inner,
                backtrace: Backtrace
            }

            impl Error {
                pub fn kind(&self) -> &Inner { &self.inner }
            }

            impl<Err> From<Err> for Error where Err: Into<Inner> {
                fn from(err: Err) -> Self {
                    Self {
                        inner: err.into(),
                        backtrace: Backtrace::new()
                    }
                }
            }

            impl std::error::Error for Error {}
            impl std::fmt::Display for Error {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { std::fmt::Debug::fmt(self, f) }
            }

            impl std::fmt::Debug for Error {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{:?}\n", &self.inner)?;
                    match std::env::var("RUST_BACKTRACE").as_ref().map(|i| i.as_ref()) {
                        Ok("full") => write!(f, "{:#?}", self.backtrace),
                        Ok("1") => write!(f, "{:?}", self.backtrace),
                        _ => write!(f, ""),
                    }
                }
            }
        }
    }
}

multi_error! { global();
    StoreError = crate::error::StoreError;
    IoError = std::io::Error;
    DecodeError = std::array::TryFromSliceError;
    MacError = hmac::digest::MacError;
    KeyLengthError = cfb8::cipher::InvalidLength;
    TimeError = std::time::SystemTimeError;
    RngError = rand::rand_core::OsError
}

pub type Result<T> = ::std::result::Result<T, global::Error>;
pub use global::Error;

#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(crate::Vnode),
    OutOfRange { vnode: crate::Vnode, boff: usize },
    InvalidArgument(&'static str),
    ReadOnly,
    Corrupt(&'static str),
    IncompatibleVersion(u32),
}

impl std::error::Error for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl StoreError {
    pub fn not_found<T>(vnode: crate::Vnode) -> Result<T> {
        Err(Self::NotFound(vnode).into())
    }

    pub fn out_of_range<T>(vnode: crate::Vnode, boff: usize) -> Result<T> {
        Err(Self::OutOfRange { vnode, boff }.into())
    }

    pub fn invalid<T>(what: &'static str) -> Result<T> {
        Err(Self::InvalidArgument(what).into())
    }

    pub fn read_only<T>() -> Result<T> {
        Err(Self::ReadOnly.into())
    }

    pub fn corrupt<T>(what: &'static str) -> Result<T> {
        Err(Self::Corrupt(what).into())
    }
}
