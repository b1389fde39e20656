//! Misbehaving peers, teardown while requests are in flight, and many
//! concurrent requests on one connection.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use iio_model::{AttrOwner, ChannelsMask, Error};
    use iio_transport::transport::{FrameReader, FrameWriter};
    use iio_transport::{Command, Opcode};
    use iiod::Backend;

    use crate::fuzz_helpers::FrameFuzzer;
    use crate::harness::TestDaemon;

    #[tokio::test]
    async fn test_unknown_opcodes_are_refused() {
        let td = TestDaemon::new().unwrap();
        let (read, write) = td.pipe();
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);
        let mut fuzzer = FrameFuzzer::new(11);

        for client_id in 1..20u16 {
            let cmd = Command {
                client_id,
                op: fuzzer.unknown_opcode(),
                dev: 0,
                code: 0,
            };
            writer.write_frame(&cmd, &[]).await.unwrap();
            let reply = reader.read_header().await.unwrap();
            assert_eq!(reply.client_id, client_id);
            assert_eq!(reply.opcode(), Ok(Opcode::Response));
            assert_eq!(reply.code, Error::InvalidArgument.code());
        }

        // still in sync
        writer
            .write_frame(&Command::new(99, Opcode::Print, 0, 0), &[])
            .await
            .unwrap();
        let reply = reader.read_header().await.unwrap();
        assert_eq!(reply.client_id, 99);
        assert_eq!(reply.code as usize, td.daemon.xml().len());
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let td = TestDaemon::new().unwrap();
        let client = td.client().await.unwrap();
        let mut fuzzer = FrameFuzzer::new(5);

        let mut tasks = Vec::new();
        for chn in 0..2usize {
            let owner = AttrOwner::Channel { dev: 1, chn };
            let raw = client.find_attr(owner, "raw").unwrap();
            let value = fuzzer.attr_value(32);
            client.write_string(raw, &value).await.unwrap();
            for _ in 0..16 {
                let client = client.clone();
                let expected = value.clone();
                tasks.push(tokio::spawn(async move {
                    assert_eq!(client.read_string(raw).await.unwrap(), expected);
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_free_buffer_ends_pending_transfer() {
        let td = TestDaemon::new().unwrap();
        let client = td.client().await.unwrap();
        let buf = client
            .create_buffer(0, 0, &ChannelsMask::from_bits(3, 0x1))
            .await
            .unwrap();
        let mut block = buf.create_block(64).await.unwrap();
        block.enqueue(0, false).await.unwrap();

        // never enabled, so the transfer can only end by teardown
        buf.free().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(2), block.dequeue(false))
            .await
            .unwrap();
        assert!(matches!(res, Err(Error::BadDescriptor | Error::Interrupted)), "{res:?}");
        assert!(!block.is_enqueued());
    }

    #[tokio::test]
    async fn test_client_shutdown_releases_session() {
        let td = TestDaemon::new().unwrap();
        let client = td.client().await.unwrap();
        let _buf = client
            .create_buffer(0, 2, &ChannelsMask::from_bits(3, 0x3))
            .await
            .unwrap();
        let _events = client.open_event_stream(0).await.unwrap();
        assert_eq!(td.daemon.buffer_count(), 1);
        assert_eq!(td.daemon.evstream_count(), 1);

        client.shutdown().await;
        for _ in 0..200 {
            if td.daemon.buffer_count() == 0 && td.daemon.evstream_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(td.daemon.buffer_count(), 0);
        assert_eq!(td.daemon.evstream_count(), 0);

        let rate = client
            .find_attr(AttrOwner::Device(0), "sampling_frequency")
            .unwrap();
        assert!(client.read_attr(rate).await.is_err());
    }

    #[tokio::test]
    async fn test_other_sessions_survive_disconnect() {
        let td = TestDaemon::new().unwrap();
        let keeper = td.client().await.unwrap();
        let leaver = td.client().await.unwrap();
        let kept = keeper
            .create_buffer(1, 0, &ChannelsMask::from_bits(2, 0x1))
            .await
            .unwrap();
        let _dropped = leaver
            .create_buffer(0, 0, &ChannelsMask::from_bits(3, 0x1))
            .await
            .unwrap();
        assert_eq!(td.daemon.buffer_count(), 2);

        leaver.shutdown().await;
        for _ in 0..200 {
            if td.daemon.buffer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(td.daemon.buffer_count(), 1);
        kept.enable().await.unwrap();
        assert_eq!(td.backend.context().devices().len(), keeper.context().devices().len());
    }
}
