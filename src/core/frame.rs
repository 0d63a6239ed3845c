use bytes::Bytes;

/// Transport-neutral websocket frame.
///
/// Transports convert their native message type into/from `WsFrame`; everything above the
/// transport (session, codec, tests) only sees this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsCloseFrame {
    pub fn reason_lossy(&self) -> String {
        String::from_utf8_lossy(self.reason.as_ref()).into_owned()
    }
}

impl WsFrame {
    #[inline]
    pub fn close(code: u16, reason: impl Into<Bytes>) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    /// Payload of a data frame (text or binary). Control frames return `None`.
    #[inline]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_))
    }
}

/// Convert owned bytes into a `WsFrame`, preferring text when bytes are valid UTF-8.
#[inline]
pub fn into_ws_frame<B>(bytes: B) -> WsFrame
where
    B: Into<Bytes>,
{
    let payload = bytes.into();
    if std::str::from_utf8(payload.as_ref()).is_ok() {
        WsFrame::Text(payload)
    } else {
        WsFrame::Binary(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_payloads_become_text_frames() {
        assert!(matches!(into_ws_frame("{\"id\":1}"), WsFrame::Text(_)));
        assert!(matches!(
            into_ws_frame(vec![0xff_u8, 0xfe]),
            WsFrame::Binary(_)
        ));
    }

    #[test]
    fn data_is_only_exposed_for_data_frames() {
        assert_eq!(
            WsFrame::Text(Bytes::from_static(b"hi")).data(),
            Some(&b"hi"[..])
        );
        assert!(WsFrame::Ping(Bytes::from_static(b"x")).data().is_none());
        assert!(WsFrame::close(1000, "bye").is_control());
    }
}
