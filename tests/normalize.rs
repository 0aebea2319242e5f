use policyserve_core::{
    normalize::{decode, encode},
    Error, HostTensor, NormalizationPipeline, NormalizationStats, Observation,
};

const H: usize = 480;
const W: usize = 640;

fn frame_hwc() -> HostTensor<u8> {
    let data: Vec<u8> = (0..H * W * 3).map(|i| (i % 251) as u8).collect();
    HostTensor::new(vec![H, W, 3], data).unwrap()
}

#[test]
fn test_camera_frame_encodes_to_model_shapes() {
    let pipeline = NormalizationPipeline::new(8, Some((H, W)));
    let obs = Observation::new(vec![0.5; 8], frame_hwc());

    let encoded = pipeline.encode(&obs).unwrap();
    assert_eq!(encoded.state.shape(), &[1, 8]);
    assert_eq!(encoded.image.shape(), &[1, 3, H, W]);
    assert!(pipeline.validate(&encoded).is_ok());
}

#[test]
fn test_batched_and_unbatched_frames_match() {
    let single = frame_hwc();
    let batched = single.clone().reshape(vec![1, H, W, 3]).unwrap();

    let a = encode(&Observation::new(vec![0.0; 8], single), 8, None).unwrap();
    let b = encode(&Observation::new(vec![0.0; 8], batched), 8, None).unwrap();
    assert_eq!(a, b);

    let two = HostTensor::<u8>::zeros(vec![2, H, W, 3]);
    assert!(matches!(
        encode(&Observation::new(vec![0.0; 8], two), 8, None),
        Err(Error::Shape(_))
    ));
}

#[test]
fn test_wrong_frame_size_rejected() {
    let pipeline = NormalizationPipeline::new(8, Some((H, W)));
    let small = HostTensor::<u8>::zeros(vec![240, 320, 3]);
    assert!(matches!(
        pipeline.encode(&Observation::new(vec![0.0; 8], small)),
        Err(Error::Shape(_))
    ));
}

#[test]
fn test_decode_inverts_training_normalization() {
    let stats = NormalizationStats::new(
        vec![0.1, -0.2, 0.3, 0.0, 1.0, 2.0, -1.0, 0.5],
        vec![1.0, 0.5, 2.0, 1.5, 0.25, 3.0, 1.0, 0.1],
    )
    .unwrap();
    let action = vec![0.3, 0.1, -0.4, 0.9, 1.2, 2.5, -0.7, 0.55];

    let normalized = stats.normalize(&action).unwrap();
    let decoded = decode(HostTensor::new(vec![1, 8], normalized).unwrap(), Some(&stats)).unwrap();
    for (a, b) in decoded.iter().zip(&action) {
        assert!((a - b).abs() < 1e-5, "{} != {}", a, b);
    }
}
