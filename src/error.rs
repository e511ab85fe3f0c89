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
    StoreError = libdrip::error::Error;
    SerdeJsonError = serde_json::Error;
    IoError = std::io::Error
}

pub type Result<T> = ::std::result::Result<T, global::Error>;
pub use global::Error;

/// Maps an error onto the errno handed back through the mount.
pub fn errno(err: &Error) -> libc::c_int {
    use libdrip::error::StoreError;

    match err.kind() {
        global::Inner::StoreError(inner) => match inner.kind() {
            libdrip::error::global::Inner::StoreError(store) => match store {
                StoreError::NotFound(_) => libc::ENOENT,
                StoreError::OutOfRange { .. } => libc::EINVAL,
                StoreError::InvalidArgument(_) => libc::EINVAL,
                StoreError::ReadOnly => libc::EROFS,
                StoreError::Corrupt(_) => libc::EIO,
                StoreError::IncompatibleVersion(_) => libc::EIO,
            },
            _ => libc::EIO,
        },
        global::Inner::SerdeJsonError(_) => libc::EIO,
        global::Inner::IoError(_) => libc::EIO,
    }
}
