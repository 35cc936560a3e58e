//! 最近邻跟踪器 (NearestTracker)
//!
//! 贪心最近中心匹配:
//! - 距离小于 `max_distance` 的 (轨迹, 检测) 对按距离从小到大依次配对
//! - 未匹配的检测开启新轨迹
//! - 未匹配的轨迹累计丢失帧, 靠近蜂群斑块时不计丢失 (蜜蜂被挡住)
//! - 丢失超过 `max_lost_frames` 的轨迹结束, 按起点到终点的竖直位移判断进出

use std::collections::BTreeSet;

use crate::config::PipelineConfig;
use crate::detection::Ellipse;

use super::{Direction, Track, TrackEvent, TrackId, TrackSnapshot, Tracker};

/// 轨迹历史长度上限
const MAX_TRAJECTORY: usize = 30;

// ========== 参数 ==========

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerParams {
    pub max_distance: f32,
    pub max_lost_frames: u32,
    /// 判定进出所需的最小竖直位移
    pub min_travel: f32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for TrackerParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_distance: config.tracker_max_distance,
            max_lost_frames: config.tracker_max_lost_frames,
            min_travel: config.tracker_min_travel,
        }
    }
}

// ========== 轨迹 ==========

/// 跟踪点 (用于绘制轨迹)
#[derive(Clone, Copy, Debug)]
struct TrackPoint {
    x: f32,
    y: f32,
}

/// 单只蜜蜂的轨迹
#[derive(Clone, Debug)]
struct BeeTrack {
    id: TrackId,
    ellipse: Ellipse,
    /// 首次出现的位置
    origin: TrackPoint,
    trajectory: Vec<TrackPoint>,
    frames_lost: u32,
    total_frames: u32,
    /// 最近一次返回给截取的帧号
    last_extracted: Option<u64>,
    labels: BTreeSet<String>,
    color: (u8, u8, u8),
}

impl BeeTrack {
    fn new(id: TrackId, ellipse: Ellipse) -> Self {
        let origin = TrackPoint {
            x: ellipse.cx,
            y: ellipse.cy,
        };
        Self {
            id,
            ellipse,
            origin,
            trajectory: vec![origin],
            frames_lost: 0,
            total_frames: 1,
            last_extracted: None,
            labels: BTreeSet::new(),
            color: id_to_color(id),
        }
    }

    fn observe(&mut self, ellipse: Ellipse) {
        self.ellipse = ellipse;
        self.frames_lost = 0;
        self.total_frames += 1;
        self.trajectory.push(TrackPoint {
            x: ellipse.cx,
            y: ellipse.cy,
        });

        // 限制轨迹长度
        if self.trajectory.len() > MAX_TRAJECTORY {
            self.trajectory.remove(0);
        }
    }

    /// 起点 → 当前位置的竖直位移判断方向
    fn direction(&self, min_travel: f32) -> Direction {
        let travel = self.origin.y - self.ellipse.cy;
        if travel >= min_travel {
            Direction::In
        } else if -travel >= min_travel {
            Direction::Out
        } else {
            Direction::Undecided
        }
    }
}

impl Track for BeeTrack {
    fn image_classification_complete(&mut self, labels: BTreeSet<String>) {
        self.labels.extend(labels);
    }
}

// ========== 跟踪器 ==========

pub struct NearestTracker {
    params: TrackerParams,
    tracks: Vec<BeeTrack>,
    next_id: TrackId,
    frame: u64,
}

impl NearestTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            tracks: Vec::new(),
            next_id: 1,
            frame: 0,
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn near_group(&self, track: &BeeTrack, groups: &[Ellipse]) -> bool {
        groups
            .iter()
            .any(|group| group.distance(&track.ellipse) < group.a + self.params.max_distance)
    }
}

impl Tracker for NearestTracker {
    fn update(&mut self, detections: &[Ellipse], groups: &[Ellipse]) -> Vec<TrackEvent> {
        self.frame += 1;

        // 候选配对按距离排序后贪心匹配
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, det) in detections.iter().enumerate() {
                let dist = track.ellipse.distance(det);
                if dist < self.params.max_distance {
                    candidates.push((dist, t, d));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (_, t, d) in candidates {
            if track_matched[t] || det_matched[d] {
                continue;
            }
            track_matched[t] = true;
            det_matched[d] = true;
            self.tracks[t].observe(detections[d]);
        }

        // 未匹配的轨迹
        for t in 0..self.tracks.len() {
            if !track_matched[t] && !self.near_group(&self.tracks[t], groups) {
                self.tracks[t].frames_lost += 1;
            }
        }

        // 结束丢失过久的轨迹
        let max_lost = self.params.max_lost_frames;
        let min_travel = self.params.min_travel;
        let mut events = Vec::new();
        self.tracks.retain(|track| {
            if track.frames_lost > max_lost {
                events.push(TrackEvent::Ended {
                    id: track.id,
                    direction: track.direction(min_travel),
                    labels: track.labels.clone(),
                });
                false
            } else {
                true
            }
        });

        // 新轨迹
        for (d, det) in detections.iter().enumerate() {
            if !det_matched[d] {
                self.tracks.push(BeeTrack::new(self.next_id, *det));
                self.next_id += 1;
            }
        }

        events
    }

    fn track_by_id(&mut self, id: TrackId) -> Option<&mut dyn Track> {
        self.tracks
            .iter_mut()
            .find(|track| track.id == id)
            .map(|track| track as &mut dyn Track)
    }

    fn last_bee_positions(&mut self, min_step: u32) -> Vec<(TrackId, Ellipse)> {
        let frame = self.frame;
        self.tracks
            .iter_mut()
            .filter(|track| track.frames_lost == 0)
            .filter(|track| match track.last_extracted {
                Some(last) => frame - last >= min_step as u64,
                None => true,
            })
            .map(|track| {
                track.last_extracted = Some(frame);
                (track.id, track.ellipse)
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<TrackSnapshot> {
        self.tracks
            .iter()
            .map(|track| TrackSnapshot {
                id: track.id,
                ellipse: track.ellipse,
                trajectory: track.trajectory.iter().map(|p| (p.x, p.y)).collect(),
                labels: track.labels.clone(),
                color: track.color,
            })
            .collect()
    }
}

// ========== 工具函数 ==========

/// 根据ID生成不同颜色
pub fn id_to_color(id: TrackId) -> (u8, u8, u8) {
    let hue = (id as f32 * 137.508) % 360.0; // 黄金角度采样
    hsv_to_rgb(hue, 0.8, 0.9)
}

/// HSV转RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}
