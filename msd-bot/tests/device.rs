mod common;

use common::{BLOCK_SIZE, MockTarget};
use msd_bot::{
    BlockDevice, BlockDeviceError, BotConfig, Endpoint, ScsiBlockDevice, SenseKey, Session,
    command::ScsiCommand,
    framer::{CommandFramer, DataPhase},
    open_block_device,
};

const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const REQUEST_SENSE: u8 = 0x03;

fn open(target: MockTarget) -> ScsiBlockDevice<MockTarget> {
    open_block_device(target, 0x06, BotConfig::default()).unwrap()
}

fn target(device: &ScsiBlockDevice<MockTarget>) -> &MockTarget {
    device.session().transport()
}

fn target_mut(device: &mut ScsiBlockDevice<MockTarget>) -> &mut MockTarget {
    device.session_mut().transport_mut()
}

#[test]
fn test_open_reads_geometry() {
    let device = open(MockTarget::new(64));
    assert_eq!(device.block_size(), BLOCK_SIZE);
    assert_eq!(device.block_count(), 64);
    assert_eq!(device.inquiry().vendor(), "MOCK");
    assert_eq!(device.inquiry().product(), "RAM Disk");
    assert_eq!(target(&device).opcodes, vec![0x12, 0x00, 0x25]);
}

#[test]
fn test_open_retries_after_unit_attention() {
    let mut mock = MockTarget::new(16);
    mock.faults.unit_attention = true;
    let device = open(mock);
    let target = target(&device);
    assert_eq!(target.count(0x00), 2);
    assert_eq!(target.count(REQUEST_SENSE), 1);
}

#[test]
fn test_open_rejects_unsupported_devices() {
    let mut mock = MockTarget::new(16);
    mock.device_type = 0x05; // CD/DVD
    assert_eq!(
        open_block_device(mock, 0x06, BotConfig::default()).err(),
        Some(BlockDeviceError::Unsupported)
    );

    let mut mock = MockTarget::new(16);
    mock.last_lba_override = Some(u32::MAX);
    assert_eq!(
        open_block_device(mock, 0x06, BotConfig::default()).err(),
        Some(BlockDeviceError::Unsupported)
    );

    // UFI floppy drives are not handled.
    let mock = MockTarget::new(16);
    let released = mock.released.clone();
    assert_eq!(
        open_block_device(mock, 0x04, BotConfig::default()).err(),
        Some(BlockDeviceError::Unsupported)
    );
    assert!(released.get());
}

#[test]
fn test_read_write_blocks() {
    let mut device = open(MockTarget::new(32));

    let mut data = vec![0u8; 3 * BLOCK_SIZE];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    device.write(&data, 5).unwrap();

    let mut read_back = vec![0u8; 3 * BLOCK_SIZE];
    device.read(&mut read_back, 5).unwrap();
    assert_eq!(read_back, data);

    let target = target(&device);
    assert_eq!(&target.disk[5 * BLOCK_SIZE..8 * BLOCK_SIZE], &data[..]);
    // One command per call.
    assert_eq!(target.count(WRITE_10), 1);
    assert_eq!(target.count(READ_10), 1);
}

#[test]
fn test_out_of_range_issues_no_command() {
    let mut device = open(MockTarget::new(8));
    let before = target(&device).opcodes.len();

    let mut buf = vec![0u8; 2 * BLOCK_SIZE];
    assert_eq!(device.read(&mut buf, 7), Err(BlockDeviceError::OutOfBounds));
    assert_eq!(device.write(&buf, 8), Err(BlockDeviceError::OutOfBounds));
    assert_eq!(
        device.read(&mut buf[..100], 0),
        Err(BlockDeviceError::UnalignedAccess)
    );

    assert_eq!(target(&device).opcodes.len(), before);
}

#[test]
fn test_oversized_request_is_unsupported() {
    let mock = MockTarget::new(16);
    let config = BotConfig::new().with_max_blocks_per_command(4);
    let mut device = open_block_device(mock, 0x06, config).unwrap();

    let mut buf = vec![0u8; 5 * BLOCK_SIZE];
    assert_eq!(device.read(&mut buf, 0), Err(BlockDeviceError::Unsupported));
    assert_eq!(target(&device).count(READ_10), 0);
    device.read(&mut buf[..4 * BLOCK_SIZE], 0).unwrap();
}

#[test]
fn test_medium_error_requests_sense_once() {
    let mut device = open(MockTarget::new(8));
    target_mut(&mut device).faults.medium_error_on_read = true;

    let mut buf = vec![0u8; BLOCK_SIZE];
    let err = device.read(&mut buf, 2).unwrap_err();
    let BlockDeviceError::Rejected(sense) = err else {
        panic!("expected a rejection, got {err:?}");
    };
    assert_eq!(sense.key(), SenseKey::MediumError);
    assert_eq!(sense.asc(), 0x11);

    // Rejections are not retried.
    let target = target(&device);
    assert_eq!(target.count(REQUEST_SENSE), 1);
    assert_eq!(target.count(READ_10), 1);
    assert_eq!(target.resets, 0);
}

#[test]
fn test_transport_error_is_retried_once() {
    let mut mock = MockTarget::new(8);
    mock.disk[BLOCK_SIZE] = 0x42;
    let mut device = open(mock);
    target_mut(&mut device).faults.phase_error = true;

    let mut buf = vec![0u8; BLOCK_SIZE];
    device.read(&mut buf, 1).unwrap();
    assert_eq!(buf[0], 0x42);

    let target = target(&device);
    assert_eq!(target.resets, 1);
    assert_eq!(target.count(READ_10), 2);
}

#[test]
fn test_cbw_failure_is_retried_once() {
    let mut device = open(MockTarget::new(8));
    target_mut(&mut device).faults.cbw_failures = 1;

    let buf = vec![0x17u8; BLOCK_SIZE];
    device.write(&buf, 3).unwrap();

    let target = target(&device);
    assert_eq!(target.resets, 1);
    assert_eq!(target.disk[3 * BLOCK_SIZE], 0x17);
}

#[test]
fn test_transport_error_gives_up_after_retry() {
    let mut session = Session::new(MockTarget::new(8));
    session.transport_mut().faults.cbw_failures = 2;
    let config = BotConfig::new().with_transport_retries(1);
    assert_eq!(
        ScsiBlockDevice::open(session, config).err(),
        Some(BlockDeviceError::Transport)
    );
}

#[test]
fn test_framer_phase_error_resets() {
    let mut session = Session::new(MockTarget::new(8));
    session.transport_mut().faults.phase_error = true;
    let mut framer = CommandFramer::new(session, 0);

    assert_eq!(
        framer.transfer(&ScsiCommand::test_unit_ready(), DataPhase::None),
        Err(BlockDeviceError::Transport)
    );
    assert_eq!(framer.session().transport().resets, 1);

    // The framer itself never retries.
    assert_eq!(framer.session().transport().opcodes.len(), 1);
    framer
        .transfer(&ScsiCommand::test_unit_ready(), DataPhase::None)
        .unwrap();
}

#[test]
fn test_framer_tag_mismatch_resets() {
    let mut session = Session::new(MockTarget::new(8));
    session.transport_mut().faults.wrong_tag = true;
    let mut framer = CommandFramer::new(session, 0);

    let mut raw = [0u8; 36];
    assert_eq!(
        framer.transfer(&ScsiCommand::inquiry(), DataPhase::In(&mut raw)),
        Err(BlockDeviceError::Transport)
    );
    assert_eq!(framer.session().transport().resets, 1);
}

#[test]
fn test_framer_clears_stalls() {
    let mut session = Session::new(MockTarget::new(8));
    session.transport_mut().faults.csw_stalls = 1;
    let mut framer = CommandFramer::new(session, 0);
    framer
        .transfer(&ScsiCommand::test_unit_ready(), DataPhase::None)
        .unwrap();
    assert_eq!(framer.session().transport().cleared, vec![Endpoint::BulkIn]);
    assert_eq!(framer.session().transport().resets, 0);

    // Two consecutive CSW stalls exhaust the single status retry.
    let mut session = framer.into_session();
    session.transport_mut().faults.csw_stalls = 2;
    let mut framer = CommandFramer::new(session, 0);
    assert_eq!(
        framer.transfer(&ScsiCommand::test_unit_ready(), DataPhase::None),
        Err(BlockDeviceError::Transport)
    );
    assert_eq!(framer.session().transport().resets, 1);
}

#[test]
fn test_framer_data_stall_still_reads_status() {
    let mut session = Session::new(MockTarget::new(8));
    session.transport_mut().faults.data_in_stall = true;
    let mut framer = CommandFramer::new(session, 0);

    let mut raw = [0u8; 36];
    let moved = framer
        .transfer(&ScsiCommand::inquiry(), DataPhase::In(&mut raw))
        .unwrap();
    assert_eq!(moved, 0);
    assert_eq!(framer.session().transport().cleared, vec![Endpoint::BulkIn]);
    assert_eq!(framer.session().transport().resets, 0);
}

#[test]
fn test_framer_counts_residue() {
    let mut session = Session::new(MockTarget::new(8));
    session.transport_mut().faults.residue = Some(6);
    let mut framer = CommandFramer::new(session, 0);

    let mut raw = [0u8; 36];
    let moved = framer
        .transfer(&ScsiCommand::inquiry(), DataPhase::In(&mut raw))
        .unwrap();
    assert_eq!(moved, 30);
}

#[test]
fn test_stalled_read_fails() {
    let mut mock = MockTarget::new(8);
    mock.disk[..BLOCK_SIZE].fill(0x5A);
    let config = BotConfig::new().with_transport_retries(0);
    let mut device = open_block_device(mock, 0x06, config).unwrap();
    target_mut(&mut device).faults.data_in_stall = true;

    let mut buf = vec![0xEEu8; BLOCK_SIZE];
    assert_eq!(device.read(&mut buf, 0), Err(BlockDeviceError::Transport));
    assert_eq!(target(&device).resets, 0);

    // The CSW was consumed, so the pipe is still in step.
    device.read(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&byte| byte == 0x5A));
}

#[test]
fn test_stalled_read_is_retried() {
    let mut mock = MockTarget::new(8);
    mock.disk[..BLOCK_SIZE].fill(0x5A);
    let mut device = open(mock);
    target_mut(&mut device).faults.data_in_stall = true;

    let mut buf = vec![0xEEu8; BLOCK_SIZE];
    device.read(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&byte| byte == 0x5A));
    assert_eq!(target(&device).count(READ_10), 2);
}

#[test]
fn test_short_read_fails() {
    let mut mock = MockTarget::new(8);
    for (i, byte) in mock.disk[2 * BLOCK_SIZE..4 * BLOCK_SIZE].iter_mut().enumerate() {
        *byte = (i % 199) as u8;
    }
    let expected = mock.disk[2 * BLOCK_SIZE..4 * BLOCK_SIZE].to_vec();
    let mut device = open(mock);
    target_mut(&mut device).faults.short_reads = 2;

    let mut buf = vec![0u8; 2 * BLOCK_SIZE];
    assert_eq!(device.read(&mut buf, 2), Err(BlockDeviceError::Transport));
    {
        let target = target(&device);
        assert_eq!(target.count(READ_10), 2);
        // The short packet ended the data stage before the CSW.
        assert_eq!(target.resets, 0);
    }

    device.read(&mut buf, 2).unwrap();
    assert_eq!(buf, expected);
}

#[test]
fn test_write_residue_fails() {
    let config = BotConfig::new().with_transport_retries(0);
    let mut device = open_block_device(MockTarget::new(8), 0x06, config).unwrap();
    target_mut(&mut device).faults.residue = Some(BLOCK_SIZE as u32);

    let buf = vec![0x11u8; 2 * BLOCK_SIZE];
    assert_eq!(device.write(&buf, 0), Err(BlockDeviceError::Transport));
    device.write(&buf, 0).unwrap();
}

#[test]
fn test_session_released_with_device() {
    let mock = MockTarget::new(8);
    let released = mock.released.clone();
    let device = open(mock);
    assert!(!released.get());
    drop(device);
    assert!(released.get());
}
