use std::io;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::frame::FrameReader;

/// Open a hijacked attach connection to `container`'s stdout and stderr.
///
/// The daemon answers the upgrade and then streams raw multiplexed frames on
/// the same socket until the container exits, so the returned reader yields
/// payload bytes only.
pub async fn attach_output(
    socket: &Path,
    container: &str,
) -> io::Result<FrameReader<BufReader<UnixStream>>> {
    let mut stream = UnixStream::connect(socket).await?;
    let request = format!(
        "POST /containers/{}/attach?stream=1&stdout=1&stderr=1 HTTP/1.1\r\n\
         Host: docker\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: 0\r\n\
         \r\n",
        container
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "daemon closed the connection before responding",
        ));
    }
    let status = parse_status(&status_line)?;
    if status != 101 && status != 200 {
        return Err(io::Error::other(format!(
            "attach rejected: {}",
            status_line.trim_end()
        )));
    }

    // Skip the response headers; the frame stream starts right after them.
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside attach response headers",
            ));
        }
        if header == "\r\n" || header == "\n" {
            break;
        }
    }

    Ok(FrameReader::new(reader))
}

fn parse_status(line: &str) -> io::Result<u16> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| io::Error::other(format!("invalid status line: {}", line.trim_end()))),
        _ => Err(io::Error::other(format!(
            "invalid status line: {}",
            line.trim_end()
        ))),
    }
}
