//! cloud-init sources rendered per domain.

use vmfleet_message::VmSpec;

/// Render the cloud-config user data for a domain.
pub fn render_cloud_config(spec: &VmSpec) -> String {
    format!(
        "#cloud-config\n\
         hostname: {id}\n\
         fqdn: {id}\n\
         preserve_hostname: false\n\
         manage_etc_hosts: true\n\
         ssh_pwauth: false\n\
         growpart:\n  mode: auto\n  devices: ['/']\n",
        id = spec.id
    )
}

/// Render the netplan v2 network config for a domain.
///
/// The guest learns its address from router advertisements on the bridge and
/// routes through the bridge's gateway address.
pub fn render_network_config(spec: &VmSpec) -> String {
    format!(
        "version: 2\n\
         ethernets:\n  \
           primary:\n    \
             match:\n      \
               name: \"e*\"\n    \
             dhcp4: false\n    \
             dhcp6: false\n    \
             accept-ra: true\n    \
             routes:\n      \
               - to: \"::/0\"\n        \
                 via: \"{gateway}\"\n        \
                 on-link: true\n",
        gateway = spec.gateway_address
    )
}
