use crate::error::Result;
use crate::pdp::{first_word, split_address};
use crate::ril::DataCallResponse;

/// Addressing for one data bearer, as handed to the host network stack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub gateway: String,
    pub dns: Vec<String>,
    pub mtu: i32,
}

impl InterfaceConfig {
    pub fn from_data_call(call: &DataCallResponse) -> Self {
        let (address, netmask) = split_address(&first_word(&call.addresses));
        Self {
            name: call.ifname.clone(),
            address,
            netmask,
            gateway: first_word(&call.gateways),
            dns: call.dnses.split_whitespace().map(str::to_string).collect(),
            mtu: call.mtu,
        }
    }
}

/// Generic network interface the context drives once a bearer is up.
pub trait NetworkStack: Send + Sync {
    fn bring_up(&self, config: &InterfaceConfig) -> Result<()>;
    fn bring_down(&self, name: &str);
}
