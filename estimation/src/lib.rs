pub mod calibration;
pub mod complementary;
pub mod config;
pub mod lowpass;
pub mod parser;
pub mod pipeline;
pub mod rotation;
pub mod sink;

use anyhow::Error;
use csv::WriterBuilder;
use nalgebra::{SVector, Vector3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Number of scalars in one IMU frame.
pub const SAMPLE_LEN: usize = 9;

/// Channel names, in frame order.
pub const CHANNEL_NAMES: [&str; SAMPLE_LEN] = [
    "ac_x", "ac_y", "ac_z", "gyr_x", "gyr_y", "gyr_z", "mag_x", "mag_y", "mag_z",
];

/// Fixed-order numeric form of an [`ImuSample`].
pub type SampleVector = SVector<f64, SAMPLE_LEN>;

/// One 9-axis IMU frame.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImuSample {
    // Accels in device units (milli-g for the ICM-20948)
    pub ac_x: f64,
    pub ac_y: f64,
    pub ac_z: f64,
    // Angular velocities in deg/s
    pub gyr_x: f64,
    pub gyr_y: f64,
    pub gyr_z: f64,
    // Mag values in micro-tesla
    pub mag_x: f64,
    pub mag_y: f64,
    pub mag_z: f64,
}

impl ImuSample {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>, mag: Vector3<f64>) -> Self {
        Self {
            ac_x: accel.x,
            ac_y: accel.y,
            ac_z: accel.z,
            gyr_x: gyro.x,
            gyr_y: gyro.y,
            gyr_z: gyro.z,
            mag_x: mag.x,
            mag_y: mag.y,
            mag_z: mag.z,
        }
    }

    pub fn from_array(v: [f64; SAMPLE_LEN]) -> Self {
        Self {
            ac_x: v[0],
            ac_y: v[1],
            ac_z: v[2],
            gyr_x: v[3],
            gyr_y: v[4],
            gyr_z: v[5],
            mag_x: v[6],
            mag_y: v[7],
            mag_z: v[8],
        }
    }

    pub fn to_array(&self) -> [f64; SAMPLE_LEN] {
        [
            self.ac_x, self.ac_y, self.ac_z, self.gyr_x, self.gyr_y, self.gyr_z, self.mag_x,
            self.mag_y, self.mag_z,
        ]
    }

    pub fn from_vector(v: &SampleVector) -> Self {
        Self::from_array((*v).into())
    }

    pub fn to_vector(&self) -> SampleVector {
        SampleVector::from(self.to_array())
    }

    pub fn accel(&self) -> Vector3<f64> {
        Vector3::new(self.ac_x, self.ac_y, self.ac_z)
    }

    /// Angular velocities as reported, in deg/s.
    pub fn gyro(&self) -> Vector3<f64> {
        Vector3::new(self.gyr_x, self.gyr_y, self.gyr_z)
    }

    /// Returns a vector of angular velocities in rads/s
    pub fn gyro_rad(&self) -> Vector3<f64> {
        Vector3::new(
            self.gyr_x.to_radians(),
            self.gyr_y.to_radians(),
            self.gyr_z.to_radians(),
        )
    }

    pub fn mag(&self) -> Vector3<f64> {
        Vector3::new(self.mag_x, self.mag_y, self.mag_z)
    }

    /// Magnetometer reading with a fixed calibration offset removed.
    pub fn adjusted_mag(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.mag() - offset
    }

    /// (name, value) pairs in frame order.
    pub fn channels(&self) -> impl Iterator<Item = (&'static str, f64)> {
        CHANNEL_NAMES.into_iter().zip(self.to_array())
    }
}

/// A sample together with the time it was received, as stored in recordings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TimedSample {
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub time: Duration,
    pub ac_x: f64,
    pub ac_y: f64,
    pub ac_z: f64,
    pub gyr_x: f64,
    pub gyr_y: f64,
    pub gyr_z: f64,
    pub mag_x: f64,
    pub mag_y: f64,
    pub mag_z: f64,
}

impl TimedSample {
    pub fn new(time: Duration, sample: &ImuSample) -> Self {
        Self {
            time,
            ac_x: sample.ac_x,
            ac_y: sample.ac_y,
            ac_z: sample.ac_z,
            gyr_x: sample.gyr_x,
            gyr_y: sample.gyr_y,
            gyr_z: sample.gyr_z,
            mag_x: sample.mag_x,
            mag_y: sample.mag_y,
            mag_z: sample.mag_z,
        }
    }

    pub fn sample(&self) -> ImuSample {
        ImuSample {
            ac_x: self.ac_x,
            ac_y: self.ac_y,
            ac_z: self.ac_z,
            gyr_x: self.gyr_x,
            gyr_y: self.gyr_y,
            gyr_z: self.gyr_z,
            mag_x: self.mag_x,
            mag_y: self.mag_y,
            mag_z: self.mag_z,
        }
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let secs = duration.as_secs_f64();
    serializer.serialize_f64(secs)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

pub fn read_csv(file_path: &Path) -> Result<Vec<TimedSample>, Error> {
    let file = File::open(file_path)?;
    let mut rdr = csv::Reader::from_reader(file);

    // Deserialize each record into a data struct
    let mut data = Vec::new();
    for result in rdr.deserialize() {
        let record: TimedSample = result?;
        data.push(record);
    }

    Ok(data)
}

pub fn write_csv(file_path: &Path, data: &[TimedSample]) -> Result<(), Error> {
    let file = File::create(file_path)?;
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
    for record in data {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
