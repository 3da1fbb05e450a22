use crate::error::Error;
use crate::test::support::{DriverOp, RecordingDriver, context};
use crate::{ChannelType, Image, ImageDesc, MemFlags, MemObject};

#[test]
fn test_creation_is_lazy_with_multiple_devices() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);
    let image = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d2(4, 4), None).unwrap();

    assert!(driver.ops().is_empty());
    assert!(image.surface().is_none());
}

#[test]
fn test_materializes_on_first_device_regardless_of_requester() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 3);
    let image = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::F32, ImageDesc::d1(8), None).unwrap();

    let dev2 = image.context().device(2).unwrap().clone();
    image.allocate_if_needed(&dev2).unwrap();

    // 8 pixels x 4 channels x 4 bytes.
    assert_eq!(driver.ops(), vec![DriverOp::AllocSurface { device: 0, size: 128 }]);
    assert!(image.surface().is_some());
}

#[test]
fn test_allocate_is_idempotent() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);
    let image = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d1(16), None).unwrap();

    let dev0 = image.context().device(0).unwrap().clone();
    let dev1 = image.context().device(1).unwrap().clone();
    image.allocate_if_needed(&dev0).unwrap();
    let first = image.surface();
    image.allocate_if_needed(&dev1).unwrap();

    assert_eq!(image.surface(), first);
    assert_eq!(driver.count(|op| matches!(op, DriverOp::AllocSurface { .. })), 1);
}

#[test]
fn test_initial_contents_upload_once() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);
    let data = vec![7u8; 6 * 4];
    let image =
        Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d2(2, 3), Some(&data)).unwrap();

    let dev1 = image.context().device(1).unwrap().clone();
    image.allocate_if_needed(&dev1).unwrap();
    image.allocate_if_needed(&dev1).unwrap();

    assert_eq!(driver.count(|op| matches!(op, DriverOp::WriteSurface { device: 0, size: 24 })), 1);
}

#[test]
fn test_host_data_size_mismatch_is_rejected() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 1);
    let data = vec![0u8; 10];

    let err =
        Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U16, ImageDesc::d1(4), Some(&data)).unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { expected: 32, actual: 10 }));
}

#[test]
fn test_zero_pixel_image_is_rejected() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 1);

    let err = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d2(0, 4), None).unwrap_err();
    assert!(matches!(err, Error::ZeroSized));
}

#[test]
fn test_single_device_context_materializes_eagerly() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 1);
    let data = vec![1u8; 4 * 4];
    let image =
        Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d1(4), Some(&data)).unwrap();

    assert!(image.surface().is_some());
    assert_eq!(driver.count(|op| matches!(op, DriverOp::AllocSurface { device: 0, size: 16 })), 1);
    assert_eq!(driver.count(|op| matches!(op, DriverOp::WriteSurface { .. })), 1);
}

#[test]
fn test_drop_frees_the_surface() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);
    let image = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d1(8), None).unwrap();

    let dev0 = image.context().device(0).unwrap().clone();
    image.allocate_if_needed(&dev0).unwrap();
    drop(image);

    assert_eq!(driver.count(|op| matches!(op, DriverOp::FreeSurface { device: 0 })), 1);
}

#[test]
fn test_migration_is_a_noop() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);
    let image = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d1(8), None).unwrap();

    let dev1 = image.context().device(1).unwrap().clone();
    image.allocate_if_needed(&dev1).unwrap();
    let before = driver.ops().len();
    image.migrate_if_needed(&dev1).unwrap();
    assert_eq!(driver.ops().len(), before);
}

#[test]
fn test_mem_object_dispatch() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);
    let image = Image::new(ctx, MemFlags::READ_WRITE, ChannelType::U8, ImageDesc::d1(8), None).unwrap();

    let object = MemObject::from(image);
    assert!(object.is_image());
    assert!(!object.is_buffer());

    let dev1 = object.context().device(1).unwrap().clone();
    object.allocate_if_needed(&dev1).unwrap();
    object.migrate_if_needed(&dev1).unwrap();
    assert_eq!(driver.count(|op| matches!(op, DriverOp::AllocSurface { device: 0, .. })), 1);
}
