//! Key namespace: `/services/{name}/{id}`

pub const SERVICE_KEY_PREFIX: &str = "/services/";

/// 某个服务所有实例的键前缀
pub fn service_prefix(service_name: &str) -> String {
    format!("{SERVICE_KEY_PREFIX}{service_name}/")
}

pub fn instance_key(service_name: &str, instance_id: &str) -> String {
    format!("{SERVICE_KEY_PREFIX}{service_name}/{instance_id}")
}

/// 将实例键还原为 (服务名, 实例ID)，不符合布局的键返回 None
pub fn parse_instance_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SERVICE_KEY_PREFIX)?;
    let (service_name, instance_id) = rest.rsplit_once('/')?;
    if service_name.is_empty() || instance_id.is_empty() {
        return None;
    }
    Some((service_name, instance_id))
}
