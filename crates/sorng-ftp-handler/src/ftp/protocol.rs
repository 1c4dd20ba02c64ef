//! Control channel framing.
//!
//! Commands go out CRLF-terminated and encoded in the configured charset.
//! Replies come back as one line, or as a `NNN-` block closed by `NNN `.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FtpResponse, ServerCharset};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Line codec over the read and write halves of the control connection.
pub struct FtpCodec<R = BufReader<OwnedReadHalf>, W = OwnedWriteHalf> {
    reader: R,
    writer: W,
    charset: ServerCharset,
}

impl FtpCodec {
    /// Split a connected socket into a buffered codec.
    pub fn from_tcp(stream: TcpStream, charset: ServerCharset) -> Self {
        let (rd, wr) = stream.into_split();
        Self::new(BufReader::new(rd), wr, charset)
    }
}

impl<R, W> FtpCodec<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, charset: ServerCharset) -> Self {
        Self { reader, writer, charset }
    }

    pub fn charset(&self) -> ServerCharset {
        self.charset
    }

    /// Write one command. The password of a `PASS` is masked in the trace log.
    pub async fn send_command(&mut self, command: &str) -> FtpResult<()> {
        let mut line = self.charset.encode(command);
        line.extend_from_slice(b"\r\n");
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        if command.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", command);
        }
        Ok(())
    }

    /// Next control line without its line terminator.
    async fn next_line(&mut self) -> FtpResult<String> {
        let mut raw = Vec::new();
        if self.reader.read_until(b'\n', &mut raw).await? == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        Ok(self.charset.decode(&raw))
    }

    /// Read one reply. A block such as
    /// ```text
    /// 211-Extensions supported:
    ///  MLST size*;modify*;
    /// 211 END
    /// ```
    /// is returned as a single `FtpResponse` holding every line.
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let head = self.next_line().await?;
        let code = parse_code(&head)?;
        let continued = head.as_bytes().get(3) == Some(&b'-');
        let mut lines = vec![head];

        if continued {
            let closing = format!("{} ", code);
            let bare = code.to_string();
            while let Some(last) = lines.last() {
                if lines.len() > 1 && (last.starts_with(&closing) || *last == bare) {
                    break;
                }
                let line = self.next_line().await?;
                lines.push(line);
            }
        }

        let reply = FtpResponse { code, lines };
        log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or(""));
        Ok(reply)
    }

    /// Round trip: command out, reply in.
    pub async fn execute(&mut self, command: &str) -> FtpResult<FtpResponse> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Round trip that turns anything but 2xx into an error.
    pub async fn expect_ok(&mut self, command: &str) -> FtpResult<FtpResponse> {
        let reply = self.execute(command).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(FtpError::from_reply(reply.code, &reply.text()))
        }
    }
}

/// The leading three digits of a reply line.
fn parse_code(line: &str) -> FtpResult<u16> {
    match line.get(..3) {
        Some(digits) if digits.bytes().all(|b| b.is_ascii_digit()) => digits
            .parse()
            .map_err(|_| FtpError::protocol_error(format!("Bad reply code: '{}'", line))),
        Some(_) => Err(FtpError::protocol_error(format!("Bad reply code: '{}'", line))),
        None => Err(FtpError::protocol_error(format!("Reply too short: '{}'", line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;

    fn codec(input: &'static [u8]) -> FtpCodec<&'static [u8], Vec<u8>> {
        FtpCodec::new(input, Vec::new(), ServerCharset::Utf8)
    }

    #[tokio::test]
    async fn test_single_line_reply() {
        let mut c = codec(b"220 ready\r\n");
        let resp = c.read_response().await.unwrap();
        assert_eq!(resp.code, 220);
        assert_eq!(resp.lines, vec!["220 ready"]);
    }

    #[tokio::test]
    async fn test_multi_line_reply() {
        let mut c = codec(b"211-Features:\r\n MDTM\r\n SIZE\r\n211 End\r\n226 next\r\n");
        let resp = c.read_response().await.unwrap();
        assert_eq!(resp.code, 211);
        assert_eq!(resp.lines.len(), 4);
        let next = c.read_response().await.unwrap();
        assert_eq!(next.code, 226);
    }

    #[tokio::test]
    async fn test_closed_connection_is_disconnected() {
        let mut c = codec(b"");
        let err = c.read_response().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Disconnected);
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_error() {
        let mut c = codec(b"hello\r\n");
        let err = c.read_response().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_execute_writes_crlf_command() {
        let mut c = codec(b"200 NOOP ok\r\n");
        let resp = c.execute("NOOP").await.unwrap();
        assert!(resp.is_completion());
        assert_eq!(c.writer, b"NOOP\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_expect_ok_rejects_failure_class() {
        let mut c = codec(b"550 No such file\r\n");
        let err = c.expect_ok("CWD nowhere").await.unwrap_err();
        assert_eq!(err.code, Some(550));
        assert_eq!(err.kind, FtpErrorKind::FileNotFound);
    }

    #[tokio::test]
    async fn test_latin1_reply_decoding() {
        let mut c = FtpCodec::new(&b"257 \"/caf\xe9\"\r\n"[..], Vec::new(), ServerCharset::Latin1);
        let resp = c.read_response().await.unwrap();
        assert_eq!(resp.text(), "257 \"/caf\u{e9}\"");
    }
}
