/// The errors which can be returned from USB/IP client operations
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The TCP connection to the USBIPD server could not be opened
    ConnectionRefused(std::io::Error),
    /// The socket closed underneath an operation in progress
    Disconnected,
    /// An op or command header failed its length, version, or code check
    MalformedFrame,
    /// A configuration descriptor buffer is shorter than its declared
    /// wTotalLength
    TruncatedDescriptor,
    /// A descriptor record declares an impossible bLength
    MalformedDescriptor,
    /// The device has no bulk-IN/bulk-OUT endpoint pair on a CDC data
    /// interface
    NotCdcSerial,
    /// OP_REP_IMPORT (or OP_REP_DEVLIST) carried a non-zero status
    AttachFailed {
        /// Busid of the device that failed to import; empty for a
        /// devlist-level failure
        busid: String,
        /// The status word from the reply
        status: u32,
    },
    /// `attach` was called after this connection already switched to the
    /// command phase
    AlreadyAttached,
    /// A frame could not be handed to the transport writer
    SendFailed,
    /// The deadline elapsed before the requested data arrived
    ReadTimeout,
    /// The transaction was cancelled by an unlink
    Unlinked,
    /// RET_SUBMIT carried a non-zero URB status
    Urb(i32),
    /// The 32-bit seqnum counter is exhausted; the connection must be
    /// re-established
    SeqnumExhausted,
}

impl ::core::fmt::Display for Error {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        match self {
            Self::ConnectionRefused(_) => f.write_str("connection refused"),
            Self::Disconnected => f.write_str("server disconnected"),
            Self::MalformedFrame => f.write_str("malformed USB/IP frame"),
            Self::TruncatedDescriptor => {
                f.write_str("configuration descriptor truncated")
            }
            Self::MalformedDescriptor => {
                f.write_str("malformed descriptor record")
            }
            Self::NotCdcSerial => {
                f.write_str("no CDC bulk endpoint pair found")
            }
            Self::AttachFailed { busid, status } => {
                write!(f, "attach of {busid:?} failed with status {status}")
            }
            Self::AlreadyAttached => {
                f.write_str("connection is already in the command phase")
            }
            Self::SendFailed => f.write_str("write to transport failed"),
            Self::ReadTimeout => f.write_str("read timed out"),
            Self::Unlinked => f.write_str("transaction unlinked"),
            Self::Urb(status) => {
                write!(f, "URB completed with status {status}")
            }
            Self::SeqnumExhausted => f.write_str("seqnum counter exhausted"),
        }
    }
}

impl ::std::error::Error for Error {
    fn source(&self) -> Option<&(dyn ::std::error::Error + 'static)> {
        match self {
            Self::ConnectionRefused(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connection_refused() {
        use ::std::error::Error;

        let e = super::Error::ConnectionRefused(::std::io::Error::new(
            ::std::io::ErrorKind::ConnectionRefused,
            "injected",
        ));
        let m = format!("{e}");
        assert_eq!(m, "connection refused".to_string());

        let m = format!("{}", e.source().unwrap());
        assert_eq!(m, "injected".to_string());
    }

    #[test]
    fn display_attach_failed() {
        use ::std::error::Error;

        let e = super::Error::AttachFailed {
            busid: "99-99".to_string(),
            status: 1,
        };
        let m = format!("{e}");
        assert_eq!(m, "attach of \"99-99\" failed with status 1".to_string());

        assert!(e.source().is_none());
    }

    #[test]
    fn display_read_timeout() {
        let e = Error::ReadTimeout;
        let m = format!("{e}");
        assert_eq!(m, "read timed out".to_string());
    }

    #[test]
    fn debug_read_timeout() {
        let e = Error::ReadTimeout;
        let e = format!("{e:?}");
        assert_eq!(e, "ReadTimeout".to_string());
    }

    #[test]
    fn display_urb_status() {
        let e = Error::Urb(-32);
        let m = format!("{e}");
        assert_eq!(m, "URB completed with status -32".to_string());
    }

    #[test]
    fn debug_malformed_frame() {
        let e = Error::MalformedFrame;
        let e = format!("{e:?}");
        assert_eq!(e, "MalformedFrame".to_string());
    }
}
