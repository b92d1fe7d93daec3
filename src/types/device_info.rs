/// Project/application metadata block read from a server-reported flash address
/// (design §3). The list of candidate addresses is itself obtained via a service
/// call (see [`crate::stw::client::StwClient::read_device_info_addresses`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfoBlock {
    pub source_address: u32,
    pub project_name: String,
    pub project_version: String,
    pub application_name: String,
    pub application_version: String,
    pub build_date: String,
    pub build_time: String,
}
