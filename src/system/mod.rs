//! System driver
//!
//! Owns the map, the trackers and the double-buffered frame pyramids,
//! and runs the per-frame state machine: preprocess, track (dense ICP
//! or relocalization), fuse, raycast the next reference. Components
//! never hold back-references; the driver passes the map into every
//! operation that needs it.


use glam::Vec3;
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{SysDesc, SystemConfig};
use crate::core::frame::{texel_valid, Frame, FrameFeatures, FramePyramid, NUM_PYRS};
use crate::core::{preprocess, ImageBuffer, Intrinsics, SE3};
use crate::features::FeatureExtractor;
use crate::fusion::raycaster::{half_sample, raycast, shade_scene, RaycastOutput};
use crate::fusion::{
    allocate_blocks, extract_mesh, integrate_frame, select_visible_blocks, HashEntry, KeyMap,
    MapStateError, Mesh, VoxelHash,
};
use crate::tracker::{IcpTracker, Relocalizer};

/// Dense verification energy above which tracking is declared lost
const ENERGY_THRESHOLD: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("invalid map state: {0}")]
    MapState(#[from] MapStateError),

    #[error("image dimensions {0}x{1} do not match the descriptor")]
    ImageSize(usize, usize),
}

/// Tracking state of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    NotInitialised,
    Ok,
    Lost,
}

/// Tagged outcome of one processed frame
#[derive(Debug, Clone, Copy)]
pub enum TrackOutcome {
    /// Dense tracking succeeded; the frame was fused
    Ok(SE3),
    /// Tracking had been lost and the relocalizer recovered this pose
    Relocalized(SE3),
    /// The frame could not be tracked; the map is unchanged
    Lost,
}

/// The SLAM system driver
pub struct System {
    desc: SysDesc,
    intr: Intrinsics,
    extractor: Box<dyn FeatureExtractor>,

    map: VoxelHash,
    key_map: KeyMap,
    tracker: IcpTracker,
    relocalizer: Relocalizer,

    state: TrackingState,
    last_state: TrackingState,
    /// Incoming frame pyramid; holds the synthesized reference after
    /// fusion and becomes `last` at the next frame's swap
    next_pyr: FramePyramid,
    last_pyr: FramePyramid,
    last_frame: Frame,
    /// Current camera pose (`T_world_camera`)
    pose: SE3,
    visible: Vec<HashEntry>,
    last_raycast: Option<RaycastOutput>,

    frame_id: u64,
    reloc_attempts: u32,
}

impl System {
    pub fn new(
        desc: SysDesc,
        config: SystemConfig,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self, SystemError> {
        config.map.validate()?;
        let intr = Intrinsics::new(desc.fx, desc.fy, desc.cx, desc.cy, desc.cols, desc.rows);
        Ok(Self {
            desc,
            intr,
            extractor,
            map: VoxelHash::new(config.map),
            key_map: KeyMap::new(),
            tracker: IcpTracker::new(config.icp),
            relocalizer: Relocalizer::new(config.reloc),
            state: TrackingState::NotInitialised,
            last_state: TrackingState::NotInitialised,
            next_pyr: FramePyramid::new(&intr),
            last_pyr: FramePyramid::new(&intr),
            last_frame: Frame::new(0, 0.0),
            pose: SE3::identity(),
            visible: Vec::new(),
            last_raycast: None,
            frame_id: 0,
            reloc_attempts: 0,
        })
    }

    /// Process one RGB-D frame. `rgb` is rows*cols*3 bytes, `depth`
    /// rows*cols raw units. Returns after fusion is complete.
    pub fn grab(&mut self, rgb: &[u8], depth: &[u16]) -> Result<TrackOutcome, SystemError> {
        if depth.len() != self.desc.cols * self.desc.rows
            || rgb.len() != self.desc.cols * self.desc.rows * 3
        {
            return Err(SystemError::ImageSize(self.desc.cols, self.desc.rows));
        }
        let metric =
            preprocess::upload_depth(depth, self.desc.cols, self.desc.rows, self.desc.depth_scale);
        Ok(self.grab_metric(rgb, &metric))
    }

    /// Variant taking depth already converted to metres
    pub fn grab_metric(&mut self, rgb: &[u8], depth: &ImageBuffer<f32>) -> TrackOutcome {
        self.frame_id += 1;

        // the freshly raycast reference becomes the ICP target
        self.last_pyr.swap(&mut self.next_pyr);
        preprocess::build_pyramid(
            depth,
            &self.intr,
            self.map.state().depth_min_fusion,
            self.desc.depth_cutoff.min(self.map.state().depth_max_fusion),
            &mut self.next_pyr,
        );

        let mut frame = Frame::new(self.frame_id, self.frame_id as f64);
        frame.features = self.extract_features(rgb);

        let color = rgb_image(rgb, self.desc.cols, self.desc.rows);
        let outcome = match self.state {
            TrackingState::NotInitialised => {
                // the first frame is accepted unconditionally
                self.pose = SE3::identity();
                frame.set_pose(self.pose);
                self.fuse_and_synthesize(&color);
                self.observe_keys(&frame);
                self.set_state(TrackingState::Ok);
                TrackOutcome::Ok(self.pose)
            }

            TrackingState::Ok => {
                let delta =
                    self.tracker
                        .align(&self.next_pyr, &self.last_pyr, &self.intr, SE3::identity());
                let verdict =
                    self.tracker
                        .residual(&self.next_pyr, &self.last_pyr, &self.intr, &delta);

                if verdict.energy.is_nan() || verdict.energy > ENERGY_THRESHOLD {
                    warn!(
                        "dense verification failed: energy {} over {} correspondences",
                        verdict.energy, verdict.correspondences
                    );
                    self.reloc_attempts = 0;
                    self.try_relocalize(&mut frame, &color)
                } else {
                    self.pose = self.pose.compose(&delta);
                    frame.set_pose(self.pose);
                    self.fuse_and_synthesize(&color);
                    self.observe_keys(&frame);
                    self.set_state(TrackingState::Ok);
                    TrackOutcome::Ok(self.pose)
                }
            }

            TrackingState::Lost => self.try_relocalize(&mut frame, &color),
        };

        self.last_frame = frame;
        outcome
    }

    fn try_relocalize(&mut self, frame: &mut Frame, color: &ImageBuffer<[u8; 3]>) -> TrackOutcome {
        self.reloc_attempts += 1;
        match self.relocalizer.relocalize(&mut frame.features, &self.key_map) {
            Some(pose) => {
                info!("relocalisation finished in {} attempts", self.reloc_attempts);
                self.pose = pose;
                frame.set_pose(pose);
                self.fuse_and_synthesize(color);
                self.observe_keys(frame);
                self.set_state(TrackingState::Ok);
                TrackOutcome::Relocalized(pose)
            }
            None => {
                debug!("relocalisation attempt {} failed", self.reloc_attempts);
                self.set_state(TrackingState::Lost);
                TrackOutcome::Lost
            }
        }
    }

    /// Fuse the incoming frame at the current pose, then raycast the
    /// model into the frame's pyramid so the next frame aligns
    /// against it.
    fn fuse_and_synthesize(&mut self, color: &ImageBuffer<[u8; 3]>) {
        let world_to_cam = self.pose.inverse();
        allocate_blocks(&self.map, &self.next_pyr.depth[0], &self.intr, &self.pose);
        self.visible = select_visible_blocks(&self.map, &self.intr, &world_to_cam);
        integrate_frame(
            &mut self.map,
            &self.visible,
            &self.next_pyr.depth[0],
            Some(color),
            &self.intr,
            &world_to_cam,
        );

        let synthesized = raycast(&self.map, &self.visible, &self.intr, &self.pose);
        self.next_pyr.vertex[0] = synthesized.vertex.clone();
        self.next_pyr.normal[0] = synthesized.normal.clone();
        for level in 1..NUM_PYRS {
            self.next_pyr.vertex[level] = half_sample(&self.next_pyr.vertex[level - 1]);
            self.next_pyr.normal[level] = half_sample(&self.next_pyr.normal[level - 1]);
        }
        self.last_raycast = Some(synthesized);
    }

    /// Detect keypoints and back-project them through the incoming
    /// vertex and normal maps.
    fn extract_features(&mut self, rgb: &[u8]) -> FrameFeatures {
        let gray = rgb_to_grayscale(rgb);
        let mut features = FrameFeatures::default();
        match self
            .extractor
            .detect_and_compute(&gray, self.desc.cols, self.desc.rows)
        {
            Ok((keypoints, descriptors)) => {
                let vmap = &self.next_pyr.vertex[0];
                let nmap = &self.next_pyr.normal[0];
                for kp in &keypoints {
                    let (u, v) = (kp.x().round() as i32, kp.y().round() as i32);
                    let vertex = vmap.sample(u, v).filter(|t| texel_valid(*t));
                    let normal = nmap.sample(u, v).filter(|t| texel_valid(*t));
                    features.points.push(vertex.map(|t| t.truncate()));
                    features.normals.push(normal.map(|t| t.truncate()));
                }
                features.keypoints = keypoints;
                features.descriptors = descriptors;
                features.clear_outliers();
            }
            Err(err) => debug!("feature extraction failed: {err}"),
        }
        features
    }

    /// Fold the frame's keypoints into the key-map and decay keys the
    /// frame should have re-observed but did not.
    fn observe_keys(&mut self, frame: &Frame) {
        self.key_map.begin_frame();
        for i in 0..frame.features.len() {
            let (Some(p), Some(n)) = (frame.features.points[i], frame.features.normals[i]) else {
                continue;
            };
            let descriptor: &[u8] = frame.features.descriptors.row(i);
            let Ok(descriptor) = descriptor.try_into() else {
                continue;
            };
            self.key_map
                .insert(frame.pose.transform(p), frame.pose.rotate(n), descriptor);
        }

        let world_to_cam = frame.pose.inverse();
        let intr = self.intr;
        let depth_max = self.map.state().depth_max_fusion;
        self.key_map.sweep(|pos: Vec3| {
            let pc = world_to_cam.transform(pos);
            if pc.z <= 0.0 || pc.z > depth_max {
                return false;
            }
            intr.project(pc).is_some_and(|px| intr.contains(px, 0))
        });
    }

    /// Fill a rows*cols*3 byte buffer with the latest shaded raycast
    pub fn render_scene(&self, image: &mut [u8]) {
        match &self.last_raycast {
            Some(output) => shade_scene(output, image),
            None => image.fill(0),
        }
    }

    /// Extract a triangle mesh of the current map
    pub fn extract_mesh(&self) -> Mesh {
        extract_mesh(&self.map)
    }

    /// Forget the tracking state without clearing the map
    pub fn reset_tracking(&mut self) {
        self.set_state(TrackingState::NotInitialised);
        self.pose = SE3::identity();
        self.reloc_attempts = 0;
    }

    fn set_state(&mut self, state: TrackingState) {
        self.last_state = self.state;
        self.state = state;
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn last_state(&self) -> TrackingState {
        self.last_state
    }

    pub fn pose(&self) -> SE3 {
        self.pose
    }

    pub fn map(&self) -> &VoxelHash {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut VoxelHash {
        &mut self.map
    }

    pub fn key_map(&self) -> &KeyMap {
        &self.key_map
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intr
    }

    pub fn last_frame(&self) -> &Frame {
        &self.last_frame
    }
}

fn rgb_to_grayscale(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| {
            (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32).round() as u8
        })
        .collect()
}

fn rgb_image(rgb: &[u8], width: usize, height: usize) -> ImageBuffer<[u8; 3]> {
    let data = rgb
        .chunks_exact(3)
        .map(|px| [px[0], px[1], px[2]])
        .collect();
    ImageBuffer::from_vec(width, height, data)
}
