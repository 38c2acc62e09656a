mod concurrent_streams;
mod device_velocity;
mod geo_restriction;
mod impossible_travel;
mod isp_velocity;
mod new_device;
mod new_location;
mod simultaneous_locations;

pub use concurrent_streams::ConcurrentStreams;
pub use device_velocity::DeviceVelocity;
pub use geo_restriction::GeoRestriction;
pub use impossible_travel::ImpossibleTravel;
pub use isp_velocity::IspVelocity;
pub use new_device::NewDevice;
pub use new_location::NewLocation;
pub use simultaneous_locations::SimultaneousLocations;
