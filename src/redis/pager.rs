use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::{self, Cmd};

use crate::context::Context;
use crate::error::StoreError;
use crate::scan::{Page, PageFetcher, PageRequest, ScanCommand};

use super::store::query_pooled;

/// Page fetcher for SCAN, SSCAN, HSCAN and ZSCAN.
#[derive(Clone)]
pub struct RedisPager {
    pool: Pool,
    command: ScanCommand,
    io_timeout: Duration,
}

impl RedisPager {
    #[must_use]
    pub fn new(pool: Pool, command: ScanCommand, io_timeout: Duration) -> Self {
        Self {
            pool,
            command,
            io_timeout,
        }
    }
}

/// Assemble `<CMD> [key] cursor [MATCH pattern] [COUNT n]`.
pub(crate) fn page_command(command: ScanCommand, request: &PageRequest) -> Result<Cmd, StoreError> {
    let mut cmd = redis::cmd(command.name());
    if command.is_keyed() {
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| StoreError::ScanError(format!("{command} requires a key")))?;
        cmd.arg(key);
    }
    cmd.arg(request.cursor);
    if let Some(pattern) = &request.pattern {
        cmd.arg("MATCH").arg(pattern);
    }
    if let Some(count) = request.count {
        cmd.arg("COUNT").arg(count);
    }
    Ok(cmd)
}

/// Keep fields or members and drop the interleaved values or scores.
///
/// Values are opaque bytes, so only the kept entries are decoded as text.
pub(crate) fn page_items(
    command: ScanCommand,
    reply: Vec<Vec<u8>>,
) -> Result<Vec<String>, StoreError> {
    reply
        .into_iter()
        .step_by(command.stride())
        .map(|item| {
            String::from_utf8(item)
                .map_err(|e| StoreError::ScanError(format!("{command} returned a non-utf-8 name: {e}")))
        })
        .collect()
}

#[async_trait]
impl PageFetcher for RedisPager {
    fn command(&self) -> ScanCommand {
        self.command
    }

    async fn fetch(&self, ctx: &Context, request: &PageRequest) -> Result<Page, StoreError> {
        let cmd = page_command(self.command, request)?;
        let (cursor, reply): (u64, Vec<Vec<u8>>) = ctx
            .run(query_pooled(&self.pool, self.io_timeout, &cmd))
            .await?;
        Ok(Page {
            cursor,
            items: page_items(self.command, reply)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: Option<&str>, pattern: Option<&str>, count: Option<usize>) -> PageRequest {
        PageRequest {
            key: key.map(str::to_string),
            cursor: 17,
            pattern: pattern.map(str::to_string),
            count,
        }
    }

    /// Bulk strings of the RESP-encoded command.
    fn args(cmd: &Cmd) -> Vec<String> {
        let packed = String::from_utf8(cmd.get_packed_command()).unwrap();
        packed
            .split("\r\n")
            .filter(|line| !line.is_empty() && !line.starts_with('*') && !line.starts_with('$'))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn keyspace_scan_has_no_key() {
        let cmd = page_command(ScanCommand::Keys, &request(None, Some("session:*"), Some(10)))
            .unwrap();
        assert_eq!(args(&cmd), ["SCAN", "17", "MATCH", "session:*", "COUNT", "10"]);
    }

    #[test]
    fn keyed_scan_puts_key_first() {
        let cmd = page_command(ScanCommand::HashFields, &request(Some("user:1"), None, None))
            .unwrap();
        assert_eq!(args(&cmd), ["HSCAN", "user:1", "17"]);
        assert!(page_command(ScanCommand::SetMembers, &request(None, None, None)).is_err());
    }

    fn bulk(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.to_vec()).collect()
    }

    #[test]
    fn drops_interleaved_values() {
        let reply = bulk(&[b"a", b"1", b"b", b"2"]);
        assert_eq!(
            page_items(ScanCommand::SortedSetMembers, reply.clone()).unwrap(),
            ["a", "b"]
        );
        assert_eq!(page_items(ScanCommand::SetMembers, reply).unwrap().len(), 4);
    }

    #[test]
    fn binary_hash_values_do_not_break_the_page() {
        let reply = bulk(&[b"alpha", b"\xff\xfe", b"beta", b"\x00\x9f"]);
        assert_eq!(
            page_items(ScanCommand::HashFields, reply).unwrap(),
            ["alpha", "beta"]
        );

        let reply = bulk(&[b"\xff"]);
        assert!(matches!(
            page_items(ScanCommand::Keys, reply),
            Err(StoreError::ScanError(_))
        ));
    }
}
