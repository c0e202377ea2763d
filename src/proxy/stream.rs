//! AEAD-framed stream: `salt || Seal(len) || Seal(payload) || ...` in each
//! direction. The write side sends its own fresh salt ahead of the first
//! chunk; the read side derives its sub-key from the peer's salt when it
//! arrives.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::Result;
use crate::crypto::{self, AeadCipher, CipherKind, MAX_PAYLOAD};

enum ReadState {
    Salt { buf: Vec<u8>, read: usize },
    Length { buf: Vec<u8>, read: usize },
    Payload { buf: Vec<u8>, read: usize },
}

enum WriteState {
    Ready,
    Writing {
        data: Vec<u8>,
        written: usize,
        consumed: usize,
    },
}

pub struct AeadStream<S> {
    inner: S,
    kind: CipherKind,
    master_key: Vec<u8>,
    encoder: AeadCipher,
    salt_to_send: Option<Vec<u8>>,
    decoder: Option<AeadCipher>,
    read_state: ReadState,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_state: WriteState,
}

impl<S> AeadStream<S> {
    pub fn new(inner: S, kind: CipherKind, master_key: Vec<u8>) -> Result<Self> {
        let salt = crypto::random_salt(kind.salt_len());
        let encoder = AeadCipher::new(kind, crypto::derive_subkey(&master_key, &salt, kind.key_len())?);
        Ok(Self {
            inner,
            read_state: ReadState::Salt {
                buf: vec![0u8; kind.salt_len()],
                read: 0,
            },
            kind,
            master_key,
            encoder,
            salt_to_send: Some(salt),
            decoder: None,
            read_buf: Vec::new(),
            read_pos: 0,
            write_state: WriteState::Ready,
        })
    }

    /// Recover the underlying transport, e.g. to drain it after a failed
    /// handshake.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Fill `buf[*read..]` from `inner`. Ready(true) once full; Ready(false) on
/// clean EOF before the first byte when `eof_ok`.
fn poll_fill<S: AsyncRead + Unpin>(
    inner: &mut S,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    read: &mut usize,
    eof_ok: bool,
) -> Poll<io::Result<bool>> {
    while *read < buf.len() {
        let mut rb = ReadBuf::new(&mut buf[*read..]);
        match Pin::new(&mut *inner).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => {
                let n = rb.filled().len();
                if n == 0 {
                    if *read == 0 && eof_ok {
                        return Poll::Ready(Ok(false));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )));
                }
                *read += n;
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(true))
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.read_pos < this.read_buf.len() {
                let remaining = &this.read_buf[this.read_pos..];
                let to_copy = remaining.len().min(out.remaining());
                out.put_slice(&remaining[..to_copy]);
                this.read_pos += to_copy;
                if this.read_pos >= this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Salt { buf, read } => {
                    if !std::task::ready!(poll_fill(&mut this.inner, cx, buf, read, true))? {
                        return Poll::Ready(Ok(())); // peer never spoke
                    }
                    let subkey = crypto::derive_subkey(&this.master_key, buf, this.kind.key_len())
                        .map_err(|e| io::Error::other(e.to_string()))?;
                    this.decoder = Some(AeadCipher::new(this.kind, subkey));
                    this.read_state = ReadState::Length {
                        buf: vec![0u8; 2 + this.kind.tag_len()],
                        read: 0,
                    };
                }
                ReadState::Length { buf, read } => {
                    if !std::task::ready!(poll_fill(&mut this.inner, cx, buf, read, true))? {
                        return Poll::Ready(Ok(())); // clean close between chunks
                    }
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(Err(io::Error::other("decoder not initialized")));
                    };
                    let plain = decoder
                        .decrypt(buf)
                        .map_err(|_| invalid_data("AEAD open failed on length frame"))?;
                    if plain.len() < 2 {
                        return Poll::Ready(Err(invalid_data("length frame too short")));
                    }
                    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if len & 0xC000 != 0 {
                        return Poll::Ready(Err(invalid_data("reserved length bits set")));
                    }
                    this.read_state = ReadState::Payload {
                        buf: vec![0u8; len + this.kind.tag_len()],
                        read: 0,
                    };
                }
                ReadState::Payload { buf, read } => {
                    std::task::ready!(poll_fill(&mut this.inner, cx, buf, read, false))?;
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(Err(io::Error::other("decoder not initialized")));
                    };
                    let plain = decoder
                        .decrypt(buf)
                        .map_err(|_| invalid_data("AEAD open failed on payload frame"))?;
                    this.read_buf = plain;
                    this.read_pos = 0;
                    this.read_state = ReadState::Length {
                        buf: vec![0u8; 2 + this.kind.tag_len()],
                        read: 0,
                    };
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let chunk = &buf[..buf.len().min(MAX_PAYLOAD)];
                    let len_frame = this
                        .encoder
                        .encrypt(&(chunk.len() as u16).to_be_bytes())
                        .map_err(|e| io::Error::other(e.to_string()))?;
                    let payload_frame = this
                        .encoder
                        .encrypt(chunk)
                        .map_err(|e| io::Error::other(e.to_string()))?;

                    let salt_len = this.salt_to_send.as_ref().map_or(0, Vec::len);
                    let mut data =
                        Vec::with_capacity(salt_len + len_frame.len() + payload_frame.len());
                    if let Some(salt) = this.salt_to_send.take() {
                        data.extend_from_slice(&salt);
                    }
                    data.extend_from_slice(&len_frame);
                    data.extend_from_slice(&payload_frame);

                    this.write_state = WriteState::Writing {
                        data,
                        written: 0,
                        consumed: chunk.len(),
                    };
                }
                WriteState::Writing {
                    data,
                    written,
                    consumed,
                } => {
                    while *written < data.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &data[*written..]) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                            }
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let n = *consumed;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
