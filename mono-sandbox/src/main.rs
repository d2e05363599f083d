use cv_core::nalgebra::{Point2, Vector2, Vector3};
use log::*;
use mono_core::{AnyCamera, CameraPose, PinholeCamera};
use mono_image::Frame;
use mono_slam::{
    export::export_map,
    synthetic::{noise_frame, smooth_trajectory, TexturedPlane},
    Configuration, LockDiagnostics, TrackerMono,
};
use serde::Serialize;
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(name = "mono-sandbox", about = "A tool for running the monocular tracker")]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `mono_slam::Configuration`, missing fields take their defaults.
    #[structopt(short, long, default_value = "mono-settings.json")]
    settings: PathBuf,
    /// The x focal length
    #[structopt(long, default_value = "400.0")]
    x_focal: f64,
    /// The y focal length
    #[structopt(long, default_value = "400.0")]
    y_focal: f64,
    /// The x optical center coordinate, defaults to the image center
    #[structopt(long)]
    x_center: Option<f64>,
    /// The y optical center coordinate, defaults to the image center
    #[structopt(long)]
    y_center: Option<f64>,
    /// The skew
    #[structopt(long, default_value = "0.0")]
    skew: f64,
    /// Run on a rendered sequence of this many frames instead of image files.
    #[structopt(long)]
    synthetic: Option<usize>,
    /// The frame size of the rendered sequence
    #[structopt(long, default_value = "320")]
    synthetic_width: u32,
    #[structopt(long, default_value = "240")]
    synthetic_height: u32,
    /// Replace these rendered frames by noise, e.g. `--occlusion 30 --occlusion 31`.
    #[structopt(long)]
    occlusion: Vec<usize>,
    /// Collect and print the lock timings of the map.
    #[structopt(long)]
    lock_diagnostics: bool,
    /// Output PLY file to deposit the map and the camera path
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Output JSON file for the camera pose of every frame
    #[structopt(short, long)]
    poses: Option<PathBuf>,
    /// Output JSON file for the frame statistics, needs them to be enabled in the settings
    #[structopt(long)]
    statistics: Option<PathBuf>,
    /// List of image files
    #[structopt(parse(from_os_str))]
    images: Vec<PathBuf>,
}

#[derive(Serialize)]
struct PoseRecord {
    frame_index: u32,
    valid: bool,
    quality: &'static str,
    motion: &'static str,
    map_version: u32,
    /// The camera center in world coordinates
    translation: [f64; 3],
    /// The `world_T_camera` rotation as `[i, j, k, w]`
    rotation: [f64; 4],
}

impl PoseRecord {
    fn new(frame_index: u32, pose: &CameraPose) -> Self {
        let translation = pose.translation();
        let rotation = pose.world_t_camera().rotation;
        let quaternion = cv_core::nalgebra::UnitQuaternion::from_rotation_matrix(&rotation);
        let coords = quaternion.coords;
        Self {
            frame_index,
            valid: pose.is_valid(),
            quality: pose.quality().name(),
            motion: pose.motion().name(),
            map_version: pose.map_version(),
            translation: [translation.x, translation.y, translation.z],
            rotation: [coords.x, coords.y, coords.z, coords.w],
        }
    }
}

fn camera(opt: &Opt, width: u32, height: u32) -> PinholeCamera {
    let center = Point2::new(
        opt.x_center.unwrap_or(f64::from(width) * 0.5),
        opt.y_center.unwrap_or(f64::from(height) * 0.5),
    );
    PinholeCamera::new(width, height, opt.x_focal)
        .focals(Vector2::new(opt.x_focal, opt.y_focal))
        .principal_point(center)
        .skew(opt.skew)
}

/// Yields the frames of the run one at a time.
fn frames<'a>(
    opt: &'a Opt,
    camera: &'a PinholeCamera,
) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn Error>>> + 'a> {
    match opt.synthetic {
        Some(count) => {
            let plane = TexturedPlane::new(3.0, 0.06, 7);
            let trajectory = smooth_trajectory(count, Vector3::zeros(), Vector3::new(0.04, 0.0, 0.0));
            Box::new(trajectory.into_iter().enumerate().map(move |(ix, world_t_camera)| {
                let frame = if opt.occlusion.contains(&ix) {
                    noise_frame(camera.width(), camera.height(), ix as u64)?
                } else {
                    plane.render(camera, &world_t_camera)?
                };
                Ok(frame)
            }))
        }
        None => Box::new(opt.images.iter().map(|path| {
            let image = image::open(path)?;
            Ok(Frame::from_dynamic(&image)?)
        })),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let settings: Configuration = settings.unwrap_or_default();

    let (width, height) = match (opt.synthetic, opt.images.first()) {
        (Some(_), _) => (opt.synthetic_width, opt.synthetic_height),
        (None, Some(path)) => image::image_dimensions(path)?,
        (None, None) => {
            warn!("neither images nor a synthetic sequence were given, nothing to do");
            return Ok(());
        }
    };
    let camera = camera(&opt, width, height);

    let diagnostics = Arc::new(LockDiagnostics::new());
    let mut tracker = TrackerMono::with_profiler(diagnostics.clone());
    tracker.configure(settings)?;

    let mut records = vec![];
    for frame in frames(&opt, &camera) {
        let frame = frame?;
        let pose = tracker.handle_frame(&camera, &frame, &Vector3::zeros(), None)?;
        let frame_index = tracker.frame_index();
        info!(
            "frame {}: {} ({} map points, {} tracks)",
            frame_index,
            pose.quality().name(),
            tracker.object_points().len(),
            tracker.number_point_tracks()
        );
        records.push(PoseRecord::new(frame_index, &pose));
    }

    // Later refinements replace the poses reported while tracking.
    for record in &mut records {
        if let Some(pose) = tracker.pose(record.frame_index) {
            *record = PoseRecord::new(record.frame_index, &pose);
        }
    }

    if let Some(path) = &opt.poses {
        info!("writing {} poses to {}", records.len(), path.display());
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &records)?;
    }

    if let Some(path) = &opt.statistics {
        let statistics = tracker.frame_statistics();
        if statistics.is_empty() {
            warn!("no frame statistics were collected, enable them in the settings");
        }
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), statistics)?;
    }

    if let Some(path) = &opt.output {
        info!("exporting the map to {}", path.display());
        if let Some(camera_poses) = tracker.camera_poses() {
            export_map(
                BufWriter::new(File::create(path)?),
                &tracker.object_points(),
                camera_poses,
                0.05,
                true,
            )?;
        }
    }

    info!("performance:\n{}", tracker.performance_report());
    if opt.lock_diagnostics {
        info!("locks:\n{}", diagnostics.report());
    }
    Ok(())
}
